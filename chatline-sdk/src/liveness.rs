//! Idle detection and keepalive probing.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::rate_limit::delta;

/// Token carried by our own `PING`, echoed back in the server's `PONG`.
pub const PROBE_TOKEN: &str = "chatline-keepalive";

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Silence after which a probe is sent.
    pub idle_threshold: Duration,
    /// Extra time the server gets to answer the probe.
    pub response_grace: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(5 * 60),
            response_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// Send `PING :<token>` now.
    SendProbe(&'static str),
    /// No answer within the grace period.
    Dead,
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    idle_threshold: TimeDelta,
    dead_after: TimeDelta,
    last_received: DateTime<Utc>,
    probe_outstanding: bool,
}

impl LivenessMonitor {
    pub fn new(config: &LivenessConfig, now: DateTime<Utc>) -> Self {
        let idle_threshold = delta(config.idle_threshold);
        Self {
            idle_threshold,
            dead_after: idle_threshold
                .checked_add(&delta(config.response_grace))
                .unwrap_or(TimeDelta::MAX),
            last_received: now,
            probe_outstanding: false,
        }
    }

    /// Any inbound line proves the connection is alive.
    pub fn on_line_received(&mut self, now: DateTime<Utc>) {
        self.last_received = now;
    }

    /// A `PONG` arrived; clears the probe if the token matches ours.
    pub fn on_pong(&mut self, token: Option<&str>) {
        if token.is_none_or(|t| t == PROBE_TOKEN) {
            self.probe_outstanding = false;
        }
    }

    pub fn check(&mut self, now: DateTime<Utc>) -> Liveness {
        let silent_for = now.signed_duration_since(self.last_received);
        if self.probe_outstanding {
            if silent_for > self.dead_after {
                return Liveness::Dead;
            }
            return Liveness::Healthy;
        }
        if silent_for > self.idle_threshold {
            self.probe_outstanding = true;
            return Liveness::SendProbe(PROBE_TOKEN);
        }
        Liveness::Healthy
    }

    /// Start over after a (re)connect.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.last_received = now;
        self.probe_outstanding = false;
    }

    pub fn last_received(&self) -> DateTime<Utc> {
        self.last_received
    }

    pub fn probe_outstanding(&self) -> bool {
        self.probe_outstanding
    }
}
