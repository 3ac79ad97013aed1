//! Ordered, coalescing queue of pending sync operations.
//!
//! The queue holds at most one entry per record. A record id that has been
//! claimed by a worker is "in flight" until the worker acks or nacks it;
//! intents that arrive meanwhile are buffered on the entry and applied once
//! the flight completes, so a record never has two requests on the wire.

mod backoff;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

pub use backoff::Backoff;

use crate::error::Result;
use crate::models::{BufferedIntent, ChangeEntry, OperationKind, RecordId, TraceId};
use crate::util::duration_millis;

/// Durable home of queue entries
///
/// Queue mutations are written through before they become visible, so a
/// failed write leaves the in-memory queue unchanged. `nack` is the
/// exception: its backoff always applies in memory.
pub trait ChangeJournal: Send + Sync {
    fn save_change(&self, entry: &ChangeEntry) -> Result<()>;
    fn remove_change(&self, record_id: &RecordId) -> Result<()>;
}

/// How an enqueued intent was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New entry
    Queued,
    /// Merged into a waiting entry whose trace is kept
    Coalesced { into: TraceId },
    /// Held until the in-flight request for the record completes
    Buffered { into: TraceId },
    /// Revived a parked entry whose trace is kept
    Unparked { into: TraceId },
}

impl EnqueueOutcome {
    /// Trace that will report progress for an intent submitted as `submitted`
    #[must_use]
    pub const fn canonical_trace(self, submitted: TraceId) -> TraceId {
        match self {
            Self::Queued => submitted,
            Self::Coalesced { into } | Self::Buffered { into } | Self::Unparked { into } => into,
        }
    }
}

/// Result of acknowledging a successful delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Entry removed
    Removed,
    /// A buffered intent replaced the entry and is ready to send
    Promoted(ChangeEntry),
}

/// Result of reporting a failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackOutcome {
    pub entry: ChangeEntry,
    /// Entry will not be retried without a user action
    pub parked: bool,
    /// Trace of a buffered intent that was merged into the entry
    pub absorbed: Option<TraceId>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<RecordId, ChangeEntry>,
    in_flight: HashSet<RecordId>,
}

impl QueueState {
    fn ready(&self, now: i64) -> Vec<&ChangeEntry> {
        let mut ready: Vec<&ChangeEntry> = self
            .entries
            .values()
            .filter(|entry| entry.is_ready(now) && !self.in_flight.contains(&entry.record_id))
            .collect();
        ready.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        ready
    }
}

pub struct ChangeQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: Backoff,
    max_attempts: u32,
    journal: Option<Arc<dyn ChangeJournal>>,
}

impl ChangeQueue {
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
            max_attempts: max_attempts.max(1),
            journal: None,
        }
    }

    /// Write every mutation through to `journal`
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn ChangeJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Load previously persisted entries without re-writing them
    pub fn restore(&self, entries: Vec<ChangeEntry>) -> Result<()> {
        let mut state = self.state.lock()?;
        for entry in entries {
            state.entries.insert(entry.record_id, entry);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Add an intent, coalescing with any entry already queued for the record
    pub fn enqueue(&self, entry: ChangeEntry) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock()?;
        let in_flight = state.in_flight.contains(&entry.record_id);

        let outcome = match state.entries.get_mut(&entry.record_id) {
            None => {
                self.persist(&entry)?;
                state.entries.insert(entry.record_id, entry);
                EnqueueOutcome::Queued
            }
            Some(existing) if in_flight => {
                let buffered = match &existing.buffered {
                    Some(previous) => BufferedIntent {
                        operation_kind: previous.operation_kind.coalesce(entry.operation_kind),
                        local_version: entry.local_version.max(previous.local_version),
                        trace_id: previous.trace_id,
                    },
                    None => BufferedIntent {
                        operation_kind: entry.operation_kind,
                        local_version: entry.local_version,
                        trace_id: entry.trace_id,
                    },
                };
                let into = buffered.trace_id;
                let mut updated = existing.clone();
                updated.buffered = Some(buffered);
                self.persist(&updated)?;
                *existing = updated;
                EnqueueOutcome::Buffered { into }
            }
            Some(existing) if existing.parked => {
                let mut updated = existing.clone();
                updated.parked = false;
                updated.attempt_count = 0;
                updated.next_eligible_at = entry.next_eligible_at;
                updated.local_version = entry.local_version.max(existing.local_version);
                updated.operation_kind = existing.operation_kind.coalesce(entry.operation_kind);
                self.persist(&updated)?;
                *existing = updated;
                EnqueueOutcome::Unparked {
                    into: existing.trace_id,
                }
            }
            Some(existing) => {
                let mut updated = existing.clone();
                updated.local_version = entry.local_version.max(existing.local_version);
                updated.operation_kind = existing.operation_kind.coalesce(entry.operation_kind);
                updated.attempt_count = existing.attempt_count.max(entry.attempt_count);
                self.persist(&updated)?;
                *existing = updated;
                EnqueueOutcome::Coalesced {
                    into: existing.trace_id,
                }
            }
        };

        drop(state);
        self.notify.notify_waiters();
        Ok(outcome)
    }

    /// Entries eligible at `now`, in enqueue order with ties broken by record id
    ///
    /// In-flight and parked entries are not ready.
    pub fn dequeue_ready(&self, now: i64) -> Result<Vec<ChangeEntry>> {
        let state = self.state.lock()?;
        Ok(state.ready(now).into_iter().cloned().collect())
    }

    /// Take the single-flight claim on the first ready entry
    pub fn claim_next(&self, now: i64) -> Result<Option<ChangeEntry>> {
        let mut state = self.state.lock()?;
        let Some(entry) = state.ready(now).first().map(|entry| (*entry).clone()) else {
            return Ok(None);
        };
        state.in_flight.insert(entry.record_id);
        Ok(Some(entry))
    }

    /// Delivery succeeded: drop the entry or promote its buffered intent
    pub fn ack(&self, record_id: &RecordId, now: i64) -> Result<AckOutcome> {
        let mut state = self.state.lock()?;
        state.in_flight.remove(record_id);

        let Some(entry) = state.entries.get(record_id) else {
            return Ok(AckOutcome::Removed);
        };

        if let Some(buffered) = &entry.buffered {
            let promoted = ChangeEntry::new(
                *record_id,
                OperationKind::Update,
                buffered.local_version,
                buffered.trace_id,
                now,
            );
            self.persist(&promoted)?;
            state.entries.insert(*record_id, promoted.clone());
            drop(state);
            self.notify.notify_waiters();
            return Ok(AckOutcome::Promoted(promoted));
        }

        if let Some(journal) = &self.journal {
            journal.remove_change(record_id)?;
        }
        state.entries.remove(record_id);
        Ok(AckOutcome::Removed)
    }

    /// Delivery failed: reschedule with backoff, or park the entry
    ///
    /// Returns `None` if the entry was removed while in flight. A journal
    /// failure is logged and the backoff still applies in memory; the next
    /// successful write or the shutdown flush persists it.
    pub fn nack(
        &self,
        record_id: &RecordId,
        retryable: bool,
        now: i64,
    ) -> Result<Option<NackOutcome>> {
        let mut state = self.state.lock()?;
        state.in_flight.remove(record_id);

        let Some(existing) = state.entries.get_mut(record_id) else {
            return Ok(None);
        };

        let mut updated = existing.clone();
        let delay = self.backoff.delay(updated.attempt_count);
        updated.attempt_count = updated.attempt_count.saturating_add(1);
        updated.next_eligible_at = now.saturating_add(duration_millis(delay));

        let mut absorbed = None;
        let had_buffered = updated.buffered.is_some();
        if let Some(buffered) = updated.buffered.take() {
            updated.local_version = updated.local_version.max(buffered.local_version);
            updated.operation_kind = updated.operation_kind.coalesce(buffered.operation_kind);
            if buffered.trace_id != updated.trace_id {
                absorbed = Some(buffered.trace_id);
            }
        }

        let exhausted = updated.attempt_count >= self.max_attempts;
        updated.parked = exhausted || (!retryable && !had_buffered);

        if let Err(error) = self.persist(&updated) {
            tracing::error!(
                record_id = %record_id,
                attempts = updated.attempt_count,
                "Failed to journal rescheduled entry: {error}"
            );
        }
        *existing = updated.clone();
        Ok(Some(NackOutcome {
            parked: updated.parked,
            entry: updated,
            absorbed,
        }))
    }

    /// User-triggered retry of a parked entry
    ///
    /// Returns the revived entry, or `None` if nothing was parked.
    pub fn retry(&self, record_id: &RecordId, now: i64) -> Result<Option<ChangeEntry>> {
        let mut state = self.state.lock()?;
        let Some(existing) = state.entries.get_mut(record_id) else {
            return Ok(None);
        };
        if !existing.parked {
            return Ok(None);
        }

        let mut updated = existing.clone();
        updated.parked = false;
        updated.attempt_count = 0;
        updated.next_eligible_at = now;
        self.persist(&updated)?;
        *existing = updated.clone();

        drop(state);
        self.notify.notify_waiters();
        Ok(Some(updated))
    }

    /// Drop the entry for a record; an in-flight claim stays until acked
    pub fn remove(&self, record_id: &RecordId) -> Result<Option<ChangeEntry>> {
        let mut state = self.state.lock()?;
        if !state.entries.contains_key(record_id) {
            return Ok(None);
        }
        if let Some(journal) = &self.journal {
            journal.remove_change(record_id)?;
        }
        Ok(state.entries.remove(record_id))
    }

    pub fn get(&self, record_id: &RecordId) -> Result<Option<ChangeEntry>> {
        Ok(self.state.lock()?.entries.get(record_id).cloned())
    }

    pub fn is_in_flight(&self, record_id: &RecordId) -> Result<bool> {
        Ok(self.state.lock()?.in_flight.contains(record_id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Earliest backoff deadline among entries a worker could claim
    pub fn next_deadline(&self) -> Result<Option<i64>> {
        let state = self.state.lock()?;
        Ok(state
            .entries
            .values()
            .filter(|entry| !entry.parked && !state.in_flight.contains(&entry.record_id))
            .map(|entry| entry.next_eligible_at)
            .min())
    }

    /// All entries in enqueue order
    pub fn snapshot(&self) -> Result<Vec<ChangeEntry>> {
        let state = self.state.lock()?;
        let mut entries: Vec<ChangeEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        Ok(entries)
    }

    /// Forget every in-flight claim (shutdown after workers stopped)
    pub fn release_in_flight(&self) -> Result<Vec<RecordId>> {
        let mut state = self.state.lock()?;
        Ok(state.in_flight.drain().collect())
    }

    /// Future that resolves on the next enqueue, promotion or retry
    ///
    /// Create it before checking the queue so a wake-up between the check
    /// and the wait is not lost.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake every waiting worker
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    fn persist(&self, entry: &ChangeEntry) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.save_change(entry),
            None => Ok(()),
        }
    }
}
