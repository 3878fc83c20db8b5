//! Durable reset timer for rolling quota windows.
//!
//! The persisted copy is the source of truth. A reset is written to the
//! repository before the in-memory timestamp moves, so a crash between the
//! two can only cause one redundant reset, never a lost one.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Result;
use crate::rate_limit::{after, delta};

/// Key used by the whisper delivery queue.
pub const WHISPER_QUEUE_KEY: &str = "WhisperQueue";

/// Storage for `{key, timestamp}` records, one per key.
pub trait ResetTimerRepository {
    fn load_reset(&self, key: &str) -> Result<Option<DateTime<Utc>>>;
    fn save_reset(&self, key: &str, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ResetTimer {
    key: String,
    last_reset: DateTime<Utc>,
    period: TimeDelta,
}

impl ResetTimer {
    /// Load the timer for `key`, starting (and persisting) a fresh window at
    /// `now` if none exists yet.
    pub fn load_or_start<R: ResetTimerRepository + ?Sized>(
        repo: &R,
        key: &str,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let last_reset = match repo.load_reset(key)? {
            Some(at) => at,
            None => {
                repo.save_reset(key, now)?;
                tracing::debug!(key, "Started new reset window");
                now
            }
        };
        Ok(Self {
            key: key.to_string(),
            last_reset,
            period: delta(period),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn last_reset(&self) -> DateTime<Utc> {
        self.last_reset
    }

    /// Whether a full period has passed since the last reset.
    pub fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= after(self.last_reset, self.period)
    }

    /// Persist `now` as the new reset point, then adopt it in memory.
    pub fn reset<R: ResetTimerRepository + ?Sized>(
        &mut self,
        repo: &R,
        now: DateTime<Utc>,
    ) -> Result<()> {
        repo.save_reset(&self.key, now)?;
        self.last_reset = now;
        Ok(())
    }
}
