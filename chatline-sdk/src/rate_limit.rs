//! Sliding-window rate limiter.
//!
//! The window reports, it does not reject: callers check
//! [`RateWindow::available_occurrences`] and then call
//! [`RateWindow::record_occurrence`] once the action actually happened.
//! Check-then-act is not atomic; every window is owned by a single
//! processing task.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Convert a config duration into a chrono delta, saturating.
pub(crate) fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `t - d`, clamped at the earliest representable instant.
pub(crate) fn before(t: DateTime<Utc>, d: TimeDelta) -> DateTime<Utc> {
    t.checked_sub_signed(d).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `t + d`, clamped at the latest representable instant.
pub(crate) fn after(t: DateTime<Utc>, d: TimeDelta) -> DateTime<Utc> {
    t.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Occurrences inside a trailing window of fixed duration and capacity.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: TimeDelta,
    max_hits: u32,
    hits: VecDeque<DateTime<Utc>>,
}

impl RateWindow {
    pub fn new(window: Duration, max_hits: u32) -> Self {
        Self {
            window: delta(window),
            max_hits,
            hits: VecDeque::with_capacity(max_hits as usize),
        }
    }

    pub fn max_hits(&self) -> u32 {
        self.max_hits
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Drop occurrences at or before `now - window` and return how many more
    /// fit in the window. Never negative.
    pub fn available_occurrences(&mut self, now: DateTime<Utc>) -> u32 {
        self.prune(now);
        let in_window = u32::try_from(self.hits.len()).unwrap_or(u32::MAX);
        self.max_hits.saturating_sub(in_window)
    }

    /// Append an occurrence unconditionally.
    pub fn record_occurrence(&mut self, t: DateTime<Utc>) {
        self.hits.push_back(t);
    }

    /// Number of stored occurrences, including any not yet pruned.
    pub fn current_hit_count(&self) -> usize {
        self.hits.len()
    }

    /// Fill the window as if its whole capacity had been used at `now`.
    pub fn saturate(&mut self, now: DateTime<Utc>) {
        self.hits.clear();
        for _ in 0..self.max_hits {
            self.hits.push_back(now);
        }
    }

    /// When the next permit frees up, or `None` if one is available now.
    pub fn next_free_at(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.available_occurrences(now) > 0 {
            return None;
        }
        self.hits.iter().min().map(|oldest| after(*oldest, self.window))
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = before(now, self.window);
        self.hits.retain(|t| *t > cutoff);
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

    #[test]
    fn fresh_window_has_full_capacity() {
        let mut w = RateWindow::new(Duration::from_secs(60), 5);
        assert_eq!(w.available_occurrences(t0()), 5);
        assert_eq!(w.current_hit_count(), 0);
    }

    #[test]
    fn occurrences_consume_and_expire() {
        let mut w = RateWindow::new(Duration::from_secs(10), 2);
        w.record_occurrence(t0());
        w.record_occurrence(t0() + secs(3));
        assert_eq!(w.available_occurrences(t0() + secs(5)), 0);
        // First hit sits exactly on the boundary and is discarded.
        assert_eq!(w.available_occurrences(t0() + secs(10)), 1);
        assert_eq!(w.available_occurrences(t0() + secs(13)), 2);
        assert_eq!(w.current_hit_count(), 0);
    }

    #[test]
    fn available_never_negative_when_overfilled() {
        let mut w = RateWindow::new(Duration::from_secs(10), 2);
        for i in 0..5 {
            w.record_occurrence(t0() + secs(i));
        }
        assert_eq!(w.available_occurrences(t0() + secs(5)), 0);
    }

    #[test]
    fn respecting_available_bounds_trailing_count() {
        let mut w = RateWindow::new(Duration::from_secs(30), 4);
        let mut sent: Vec<DateTime<Utc>> = Vec::new();
        // Try to act every second for two minutes.
        for i in 0..120 {
            let now = t0() + secs(i);
            if w.available_occurrences(now) > 0 {
                w.record_occurrence(now);
                sent.push(now);
            }
            let trailing = sent.iter().filter(|t| **t > now - secs(30)).count();
            assert!(trailing <= 4, "trailing count {trailing} at {i}s");
        }
        assert_eq!(sent.len(), 16);
    }

    #[test]
    fn current_hit_count_does_not_prune() {
        let mut w = RateWindow::new(Duration::from_secs(1), 3);
        w.record_occurrence(t0());
        assert_eq!(w.current_hit_count(), 1);
        assert_eq!(w.current_hit_count(), 1);
        assert_eq!(w.available_occurrences(t0() + secs(5)), 3);
        assert_eq!(w.current_hit_count(), 0);
    }

    #[test]
    fn saturate_blocks_for_one_full_window() {
        let mut w = RateWindow::new(Duration::from_secs(60), 100);
        w.record_occurrence(t0() - secs(30));
        w.saturate(t0());
        assert_eq!(w.available_occurrences(t0()), 0);
        assert_eq!(w.available_occurrences(t0() + secs(59)), 0);
        assert_eq!(w.available_occurrences(t0() + secs(60)), 100);
    }

    #[test]
    fn next_free_at_tracks_oldest_hit() {
        let mut w = RateWindow::new(Duration::from_secs(10), 1);
        assert_eq!(w.next_free_at(t0()), None);
        w.record_occurrence(t0());
        assert_eq!(w.next_free_at(t0() + secs(2)), Some(t0() + secs(10)));
    }
}
