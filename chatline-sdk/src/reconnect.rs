//! Exponential backoff for reconnect attempts.
//!
//! Retry scheduling is decoupled from the step cadence: each step asks
//! [`Backoff::should_retry`] whether `now` has reached
//! `last_failure + interval`.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{ChatError, Result};
use crate::rate_limit::{after, delta};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First retry delay.
    pub initial: Duration,
    /// Delay ceiling.
    pub max: Duration,
    /// How long the delay may sit at the ceiling before giving up.
    pub max_outage: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(120),
            max_outage: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    seed: TimeDelta,
    ceiling: TimeDelta,
    max_outage: TimeDelta,
    interval: TimeDelta,
    last_failure: Option<DateTime<Utc>>,
    /// When the interval first reached the ceiling in the current outage.
    at_ceiling_since: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let seed = delta(config.initial);
        Self {
            seed,
            ceiling: delta(config.max).max(seed),
            max_outage: delta(config.max_outage),
            interval: seed,
            last_failure: None,
            at_ceiling_since: None,
            consecutive_failures: 0,
        }
    }

    /// Record a failed attempt. The first failure waits one seed interval,
    /// each further consecutive failure doubles it up to the ceiling.
    ///
    /// Returns [`ChatError::ReconnectExhausted`] once the ceiling has been
    /// reached and attempts keep failing for longer than `max_outage`.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.last_failure.is_some() {
            self.interval = self
                .interval
                .checked_add(&self.interval)
                .unwrap_or(self.ceiling)
                .min(self.ceiling);
        } else {
            self.interval = self.seed;
        }
        self.last_failure = Some(now);
        self.consecutive_failures += 1;

        if self.interval >= self.ceiling {
            let since = *self.at_ceiling_since.get_or_insert(now);
            if now.signed_duration_since(since) > self.max_outage {
                return Err(ChatError::ReconnectExhausted { since });
            }
        }
        Ok(())
    }

    /// A connect succeeded; forget the outage.
    pub fn record_success(&mut self) {
        self.interval = self.seed;
        self.last_failure = None;
        self.at_ceiling_since = None;
        self.consecutive_failures = 0;
    }

    /// Whether a retry is due. Always true outside an outage.
    pub fn should_retry(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at() {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure.map(|f| after(f, self.interval))
    }

    pub fn current_interval(&self) -> TimeDelta {
        self.interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    fn backoff(initial: u64, max: u64) -> Backoff {
        Backoff::new(&BackoffConfig {
            initial: Duration::from_secs(initial),
            max: Duration::from_secs(max),
            max_outage: Duration::from_secs(600),
        })
    }

    #[test]
    fn no_outage_means_retry_immediately() {
        let b = backoff(1, 60);
        assert!(b.should_retry(t0()));
        assert_eq!(b.next_retry_at(), None);
    }

    #[test]
    fn three_failures_wait_s_2s_4s() {
        let mut b = backoff(2, 60);

        b.record_failure(t0()).unwrap();
        assert!(!b.should_retry(t0() + secs(1)));
        assert!(b.should_retry(t0() + secs(2)));

        let f2 = t0() + secs(2);
        b.record_failure(f2).unwrap();
        assert!(!b.should_retry(f2 + secs(3)));
        assert!(b.should_retry(f2 + secs(4)));

        let f3 = f2 + secs(4);
        b.record_failure(f3).unwrap();
        assert!(!b.should_retry(f3 + secs(7)));
        assert!(b.should_retry(f3 + secs(8)));
        assert_eq!(b.consecutive_failures(), 3);
    }

    #[test]
    fn interval_capped_at_ceiling() {
        let mut b = backoff(1, 5);
        let mut now = t0();
        for _ in 0..6 {
            b.record_failure(now).unwrap();
            now += secs(10);
        }
        assert_eq!(b.current_interval(), secs(5));
    }

    #[test]
    fn success_resets_to_seed() {
        let mut b = backoff(1, 60);
        b.record_failure(t0()).unwrap();
        b.record_failure(t0() + secs(1)).unwrap();
        b.record_success();
        assert_eq!(b.current_interval(), secs(1));
        assert!(b.should_retry(t0() + secs(1)));
        b.record_failure(t0() + secs(5)).unwrap();
        assert_eq!(b.current_interval(), secs(1));
    }

    #[test]
    fn long_outage_at_ceiling_is_fatal() {
        let mut b = backoff(1, 4);
        b.record_failure(t0()).unwrap();
        b.record_failure(t0() + secs(1)).unwrap();
        // Interval reaches the 4s ceiling here.
        b.record_failure(t0() + secs(3)).unwrap();
        b.record_failure(t0() + secs(300)).unwrap();
        let err = b.record_failure(t0() + secs(604)).unwrap_err();
        assert!(matches!(err, ChatError::ReconnectExhausted { .. }));
    }
}
