//! Public channel writer throttle.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::irc::sanitize;
use crate::rate_limit::RateWindow;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_lines: u32,
    pub window: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_lines: 20,
            window: Duration::from_secs(30),
        }
    }
}

/// FIFO of channel lines released no faster than the window allows.
///
/// The occurrence is recorded in [`ChannelThrottle::confirm_sent`], after the
/// write actually went out; a failed write leaves the line at the front.
#[derive(Debug, Clone)]
pub struct ChannelThrottle {
    lines: VecDeque<String>,
    window: RateWindow,
}

impl ChannelThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            lines: VecDeque::new(),
            window: RateWindow::new(config.window, config.max_lines),
        }
    }

    /// Queue channel text. Empty lines are ignored.
    pub fn enqueue(&mut self, text: &str) {
        let line = sanitize(text);
        if line.trim().is_empty() {
            return;
        }
        self.lines.push_back(line);
    }

    /// The next line, if one is queued and the window has room.
    pub fn peek_ready(&mut self, now: DateTime<Utc>) -> Option<&str> {
        if self.lines.is_empty() || self.window.available_occurrences(now) == 0 {
            return None;
        }
        self.lines.front().map(|s| s.as_str())
    }

    /// The front line was written; drop it and count it.
    pub fn confirm_sent(&mut self, now: DateTime<Utc>) {
        if self.lines.pop_front().is_some() {
            self.window.record_occurrence(now);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
