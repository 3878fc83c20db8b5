//! Quota-aware whisper delivery queue.
//!
//! Three quotas apply to private messages: a per-second and a per-minute
//! send rate, and a cap on unique recipients per rolling day. The queue
//! enforces the first two through [`RateWindow`]s and the third through the
//! recipient ledger, which is cleared when the persisted [`ResetTimer`]
//! says the day has elapsed.
//!
//! Admission is the backpressure point: a whisper to a recipient that would
//! not fit in the ledger is refused at enqueue time instead of being
//! buffered indefinitely.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::rate_limit::RateWindow;
use crate::reset_timer::{ResetTimer, ResetTimerRepository, WHISPER_QUEUE_KEY};

/// A pending private message.
///
/// Equality and hashing use `(recipient, body, enqueued_at)` only; the
/// resolved id is not part of a whisper's identity.
#[derive(Debug, Clone)]
pub struct WhisperRecord {
    /// Lowercased login of the recipient.
    pub recipient: String,
    /// Platform user id, backfilled once resolved.
    pub recipient_id: Option<String>,
    pub body: String,
    pub enqueued_at: DateTime<Utc>,
}

impl PartialEq for WhisperRecord {
    fn eq(&self, other: &Self) -> bool {
        self.recipient == other.recipient
            && self.body == other.body
            && self.enqueued_at == other.enqueued_at
    }
}

impl Eq for WhisperRecord {}

impl Hash for WhisperRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.recipient.hash(state);
        self.body.hash(state);
        self.enqueued_at.hash(state);
    }
}

/// Quotas and tuning for the whisper queue.
#[derive(Debug, Clone)]
pub struct WhisperLimits {
    pub per_second: u32,
    pub per_minute: u32,
    pub max_unique_recipients: usize,
    /// Length of the unique-recipient window.
    pub recipient_window: Duration,
    /// Consecutive starved ticks before the queue is purged.
    pub starvation_tick_limit: u32,
    /// Bodies longer than this many bytes are truncated.
    pub max_body_len: usize,
}

impl Default for WhisperLimits {
    fn default() -> Self {
        Self {
            per_second: 3,
            per_minute: 100,
            max_unique_recipients: 40,
            recipient_window: Duration::from_secs(24 * 60 * 60),
            starvation_tick_limit: 600,
            max_body_len: 500,
        }
    }
}

/// Result of [`WhisperQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// An identical record is already pending.
    Duplicate,
    /// The recipient is permanently unreachable.
    Blacklisted,
    /// A new recipient would not fit in today's ledger.
    LedgerFull,
}

pub struct WhisperQueue {
    limits: WhisperLimits,
    pending: Vec<WhisperRecord>,
    per_second: RateWindow,
    per_minute: RateWindow,
    ledger: HashSet<String>,
    blacklist: HashSet<String>,
    resolved_ids: HashMap<String, String>,
    new_recipients_allowed: bool,
    reset_timer: ResetTimer,
    starved_ticks: u32,
}

impl WhisperQueue {
    pub fn new<R: ResetTimerRepository + ?Sized>(
        limits: WhisperLimits,
        repo: &R,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let reset_timer =
            ResetTimer::load_or_start(repo, WHISPER_QUEUE_KEY, limits.recipient_window, now)?;
        Ok(Self {
            per_second: RateWindow::new(Duration::from_secs(1), limits.per_second),
            per_minute: RateWindow::new(Duration::from_secs(60), limits.per_minute),
            limits,
            pending: Vec::new(),
            ledger: HashSet::new(),
            blacklist: HashSet::new(),
            resolved_ids: HashMap::new(),
            new_recipients_allowed: true,
            reset_timer,
            starved_ticks: 0,
        })
    }

    /// Try to queue a whisper to `username`.
    pub fn enqueue(
        &mut self,
        username: &str,
        user_id: Option<String>,
        body: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        let recipient = username.trim().to_lowercase();
        if self.blacklist.contains(&recipient) {
            tracing::debug!(%recipient, "Whisper to blacklisted recipient dropped");
            return Admission::Blacklisted;
        }

        let recipient_id = user_id.or_else(|| self.resolved_ids.get(&recipient).cloned());
        let record = WhisperRecord {
            recipient,
            recipient_id,
            body: truncate(body, self.limits.max_body_len),
            enqueued_at: now,
        };
        if self.pending.contains(&record) {
            return Admission::Duplicate;
        }

        if !self.is_known(&record.recipient) && !self.has_room_for_new_recipient() {
            tracing::debug!(
                recipient = %record.recipient,
                ledger = self.ledger.len(),
                new_allowed = self.new_recipients_allowed,
                "Whisper refused, no room for a new recipient"
            );
            return Admission::LedgerFull;
        }

        self.pending.push(record);
        Admission::Queued
    }

    /// Whether both rate windows have a permit left.
    pub fn has_permits(&mut self, now: DateTime<Utc>) -> bool {
        self.per_second.available_occurrences(now) > 0
            && self.per_minute.available_occurrences(now) > 0
    }

    /// Remove and return the oldest eligible record.
    ///
    /// With the ledger at capacity only already-ledgered recipients are
    /// eligible. A non-empty queue with nothing eligible counts as a
    /// starved tick; too many in a row purge the queue.
    pub fn select_next(&mut self, now: DateTime<Utc>) -> Option<WhisperRecord> {
        if self.pending.is_empty() {
            self.starved_ticks = 0;
            return None;
        }
        if !self.has_permits(now) {
            return None;
        }

        let ledger_full = self.ledger_full();
        let next = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, r)| !ledger_full || self.ledger.contains(&r.recipient))
            .min_by_key(|(_, r)| r.enqueued_at)
            .map(|(i, _)| i);

        match next {
            Some(i) => {
                self.starved_ticks = 0;
                Some(self.pending.remove(i))
            }
            None => {
                self.note_starved_tick();
                None
            }
        }
    }

    /// The whisper was delivered: consume quota, ledger the recipient and
    /// roll the daily window if it has elapsed.
    pub fn report_success<R: ResetTimerRepository + ?Sized>(
        &mut self,
        record: &WhisperRecord,
        repo: &R,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.per_second.record_occurrence(now);
        self.per_minute.record_occurrence(now);
        self.ledger.insert(record.recipient.clone());
        if let Some(ref id) = record.recipient_id {
            self.resolved_ids.insert(record.recipient.clone(), id.clone());
        }

        if self.reset_timer.has_elapsed(now) {
            // Durable first; the in-memory ledger only follows a persisted reset.
            self.reset_timer.reset(repo, now)?;
            self.ledger.clear();
            self.ledger.insert(record.recipient.clone());
            self.new_recipients_allowed = true;
            tracing::info!("Unique-recipient window rolled over");
        }
        Ok(())
    }

    /// Put a record back for a later tick. Only for transient failures.
    pub fn report_failure(&mut self, record: WhisperRecord) {
        if !self.pending.contains(&record) {
            self.pending.push(record);
        }
    }

    /// Saturate the per-minute window so nothing is sent for a full minute.
    pub fn freeze(&mut self, now: DateTime<Utc>) {
        self.per_minute.saturate(now);
        tracing::warn!(pending = self.pending.len(), "Whisper queue frozen for one window");
    }

    /// Stop admitting recipients that are not already known.
    pub fn disable_new_recipients(&mut self) {
        self.new_recipients_allowed = false;
    }

    /// Permanently refuse whispers to `username`, dropping any pending ones.
    pub fn blacklist(&mut self, username: &str) -> usize {
        let recipient = username.trim().to_lowercase();
        let before = self.pending.len();
        self.pending.retain(|r| r.recipient != recipient);
        self.blacklist.insert(recipient);
        before - self.pending.len()
    }

    pub fn is_blacklisted(&self, username: &str) -> bool {
        self.blacklist.contains(&username.trim().to_lowercase())
    }

    /// Remember a resolved id for later enqueues to the same login.
    pub fn remember_id(&mut self, username: &str, user_id: &str) {
        self.resolved_ids
            .insert(username.trim().to_lowercase(), user_id.to_string());
    }

    pub fn pending(&self) -> &[WhisperRecord] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn ledger(&self) -> &HashSet<String> {
        &self.ledger
    }

    pub fn new_recipients_allowed(&self) -> bool {
        self.new_recipients_allowed
    }

    pub fn reset_timer(&self) -> &ResetTimer {
        &self.reset_timer
    }

    /// Per-minute permits left at `now`.
    pub fn minute_permits(&mut self, now: DateTime<Utc>) -> u32 {
        self.per_minute.available_occurrences(now)
    }

    fn ledger_full(&self) -> bool {
        self.ledger.len() >= self.limits.max_unique_recipients
    }

    fn is_known(&self, recipient: &str) -> bool {
        self.ledger.contains(recipient) || self.pending.iter().any(|r| r.recipient == recipient)
    }

    /// Ledgered recipients plus distinct not-yet-ledgered pending ones.
    fn committed_recipients(&self) -> usize {
        let waiting: HashSet<&str> = self
            .pending
            .iter()
            .map(|r| r.recipient.as_str())
            .filter(|r| !self.ledger.contains(*r))
            .collect();
        self.ledger.len() + waiting.len()
    }

    fn has_room_for_new_recipient(&self) -> bool {
        self.new_recipients_allowed
            && self.committed_recipients() < self.limits.max_unique_recipients
    }

    fn note_starved_tick(&mut self) {
        self.starved_ticks += 1;
        if self.starved_ticks < self.limits.starvation_tick_limit {
            return;
        }
        tracing::error!(
            pending = self.pending.len(),
            ticks = self.starved_ticks,
            ledger = self.ledger.len(),
            "Whisper queue starved, purging"
        );
        for record in &self.pending {
            tracing::error!(
                recipient = %record.recipient,
                recipient_id = ?record.recipient_id,
                enqueued_at = %record.enqueued_at,
                body = %record.body,
                "Purged undeliverable whisper"
            );
        }
        self.pending.clear();
        self.starved_ticks = 0;
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
