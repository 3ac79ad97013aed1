//! Local record store: quota, LRU eviction, tombstones and the state machine
//!
//! `SqliteRecordRepository` only knows rows; every policy decision about
//! what may be written, evicted or revived lives here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::db::{Database, SqliteChangeRepository, SqliteRecordRepository, StoredRecord};
use crate::error::{Error, Result};
use crate::models::{
    ChangeEntry, ConflictWinner, Payload, Record, RecordId, SyncConflict, SyncState, TraceId,
};
use crate::queue::ChangeJournal;
use crate::util::{duration_millis, unix_millis_now};

/// Result of a successful `put`
#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    /// Record as stored, with bumped version and `Pending` state
    pub record: Record,
    /// Committed records dropped to make room, least recently used first
    pub evicted: Vec<RecordId>,
}

/// What happened when a server answer was applied to the local copy
#[derive(Debug, Clone, PartialEq)]
pub enum ServerApply {
    /// Local copy now matches the server and is `Committed`
    Committed(Record),
    /// A newer local version was written meanwhile; it stays queued
    Superseded(Record),
    /// Record was deleted or evicted meanwhile
    Gone,
}

pub struct LocalRecordStore {
    db: Database,
    quota_bytes: u64,
    tombstone_ttl: Duration,
    access_clock: AtomicI64,
}

impl LocalRecordStore {
    pub fn new(db: Database, quota_bytes: u64, tombstone_ttl: Duration) -> Result<Self> {
        let last_access =
            db.with_connection(|conn| SqliteRecordRepository::new(conn).max_last_accessed())?;
        Ok(Self {
            db,
            quota_bytes,
            tombstone_ttl,
            access_clock: AtomicI64::new(last_access),
        })
    }

    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>, quota_bytes: u64, tombstone_ttl: Duration) -> Result<Self> {
        Self::new(Database::open(path)?, quota_bytes, tombstone_ttl)
    }

    pub fn open_in_memory(quota_bytes: u64, tombstone_ttl: Duration) -> Result<Self> {
        Self::new(Database::open_in_memory()?, quota_bytes, tombstone_ttl)
    }

    pub const fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Store a local mutation
    ///
    /// Bumps `local_version`, stamps `modified_at` and moves the record to
    /// `Pending`. Committed records are evicted in LRU order if the quota
    /// requires it; if eviction cannot free enough space nothing is evicted
    /// and `QuotaExceeded` is returned.
    pub fn put(&self, record: Record) -> Result<PutOutcome> {
        let now = unix_millis_now();
        let access = self.next_access();

        self.db.transaction(|tx| {
            let repo = SqliteRecordRepository::new(tx);
            let existing = repo.get(&record.id)?;

            if let Some(stored) = &existing {
                if let Some(deleted_at) = stored.deleted_at {
                    if !self.tombstone_expired(deleted_at, now) {
                        return Err(Error::Tombstoned(record.id.as_str()));
                    }
                } else if stored.record.owner_id != record.owner_id {
                    return Err(Error::InvalidInput(format!(
                        "owner of record {} cannot change",
                        record.id
                    )));
                }
            }

            let mut next = record;
            if let Some(stored) = &existing {
                let current = &stored.record;
                if stored.deleted_at.is_none()
                    && !current.sync_state.can_transition_to(SyncState::Pending)
                {
                    return Err(Error::InvalidTransition {
                        record_id: next.id.as_str(),
                        from: current.sync_state,
                        to: SyncState::Pending,
                    });
                }
                next.local_version = next.local_version.max(current.local_version);
                next.updated_at = current.updated_at;
            }
            next.local_version += 1;
            next.modified_at = now;
            next.sync_state = SyncState::Pending;

            let size = next.storage_size();
            let evicted = self.make_room(&repo, &next.id, size)?;
            repo.upsert(&next, i64::try_from(size).unwrap_or(i64::MAX), access)?;

            if !evicted.is_empty() {
                tracing::info!(
                    record_id = %next.id,
                    evicted = evicted.len(),
                    "Evicted committed records to stay within quota"
                );
            }
            Ok(PutOutcome {
                record: next,
                evicted,
            })
        })
    }

    /// Live record by id; refreshes its LRU position
    pub fn get(&self, id: &RecordId) -> Result<Record> {
        let access = self.next_access();
        self.db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            let record = live(repo.get(id)?).ok_or_else(|| Error::NotFound(id.as_str()))?;
            repo.touch(id, access)?;
            Ok(record)
        })
    }

    /// Row by id, tombstones included, without touching the LRU order
    pub fn load(&self, id: &RecordId) -> Result<Option<StoredRecord>> {
        self.db
            .with_connection(|conn| SqliteRecordRepository::new(conn).get(id))
    }

    /// Tombstone a live record
    pub fn delete(&self, id: &RecordId) -> Result<()> {
        let now = unix_millis_now();
        let deleted = self
            .db
            .with_connection(|conn| SqliteRecordRepository::new(conn).tombstone(id, now))?;
        if !deleted {
            return Err(Error::NotFound(id.as_str()));
        }
        tracing::debug!(record_id = %id, "Record tombstoned");
        Ok(())
    }

    /// Whether a live tombstone blocks `id`
    pub fn is_tombstoned(&self, id: &RecordId) -> Result<bool> {
        let now = unix_millis_now();
        let deleted_at = self.load(id)?.and_then(|stored| stored.deleted_at);
        Ok(deleted_at.is_some_and(|deleted_at| !self.tombstone_expired(deleted_at, now)))
    }

    /// Move a live record through the state machine
    pub fn set_sync_state(&self, id: &RecordId, state: SyncState) -> Result<Record> {
        self.db.transaction(|tx| {
            let repo = SqliteRecordRepository::new(tx);
            let mut record = live(repo.get(id)?).ok_or_else(|| Error::NotFound(id.as_str()))?;
            transition(&mut record, state)?;
            repo.set_state(id, state)?;
            Ok(record)
        })
    }

    /// Record that the server acknowledged `sent_version`
    ///
    /// The record is committed only if no newer local version exists;
    /// `updated_at` is stored either way.
    pub fn apply_server_ack(
        &self,
        id: &RecordId,
        sent_version: i64,
        server_updated_at: i64,
    ) -> Result<ServerApply> {
        self.db.transaction(|tx| {
            let repo = SqliteRecordRepository::new(tx);
            let Some(mut record) = live(repo.get(id)?) else {
                return Ok(ServerApply::Gone);
            };

            record.updated_at = Some(server_updated_at);
            repo.set_updated_at(id, server_updated_at)?;

            if record.local_version != sent_version {
                return Ok(ServerApply::Superseded(record));
            }
            transition(&mut record, SyncState::Committed)?;
            repo.set_state(id, SyncState::Committed)?;
            Ok(ServerApply::Committed(record))
        })
    }

    /// Replace the local copy with the server's after a lost conflict
    ///
    /// Never revives a tombstone and never overwrites a local version newer
    /// than `expected_version`.
    pub fn overwrite_from_server(
        &self,
        id: &RecordId,
        payload: Payload,
        server_updated_at: i64,
        expected_version: i64,
    ) -> Result<ServerApply> {
        let access = self.next_access();
        self.db.transaction(|tx| {
            let repo = SqliteRecordRepository::new(tx);
            let Some(mut record) = live(repo.get(id)?) else {
                return Ok(ServerApply::Gone);
            };
            if record.local_version != expected_version {
                return Ok(ServerApply::Superseded(record));
            }

            transition(&mut record, SyncState::Committed)?;
            record.payload = payload;
            record.updated_at = Some(server_updated_at);
            let size = i64::try_from(record.storage_size()).unwrap_or(i64::MAX);
            repo.upsert(&record, size, access)?;
            Ok(ServerApply::Committed(record))
        })
    }

    pub fn list_by_state(&self, state: SyncState) -> Result<Vec<Record>> {
        self.db
            .with_connection(|conn| SqliteRecordRepository::new(conn).list_by_state(state))
    }

    /// Live records per state; every state is present
    pub fn state_counts(&self) -> Result<HashMap<SyncState, usize>> {
        let mut counts = self
            .db
            .with_connection(|conn| SqliteRecordRepository::new(conn).state_counts())?;
        for state in SyncState::ALL {
            counts.entry(state).or_insert(0);
        }
        Ok(counts)
    }

    /// Bytes charged against the quota by live records
    pub fn used_bytes(&self) -> Result<u64> {
        let used = self
            .db
            .with_connection(|conn| SqliteRecordRepository::new(conn).used_bytes(None))?;
        Ok(u64::try_from(used).unwrap_or(0))
    }

    /// Drop tombstones older than the TTL
    pub fn purge_tombstones(&self, now: i64) -> Result<usize> {
        let cutoff = now.saturating_sub(duration_millis(self.tombstone_ttl));
        let purged = self
            .db
            .with_connection(|conn| SqliteRecordRepository::new(conn).purge_tombstones(cutoff))?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired tombstones");
        }
        Ok(purged)
    }

    /// Return interrupted records to `Pending` after a restart or shutdown
    pub fn reset_in_flight(&self) -> Result<usize> {
        self.db.transaction(|tx| {
            let repo = SqliteRecordRepository::new(tx);
            let in_flight = repo.reset_states(SyncState::InFlight, SyncState::Pending)?;
            let conflicted = repo.reset_states(SyncState::Conflicted, SyncState::Pending)?;
            Ok(in_flight + conflicted)
        })
    }

    /// Append a last-write-wins resolution to the conflict log
    pub fn record_conflict(
        &self,
        record_id: &RecordId,
        trace_id: &TraceId,
        local_modified_at: i64,
        server_updated_at: i64,
        winner: ConflictWinner,
    ) -> Result<()> {
        let resolved_at = unix_millis_now();
        self.db.with_connection(|conn| {
            SqliteRecordRepository::new(conn).insert_conflict(
                record_id,
                trace_id,
                local_modified_at,
                server_updated_at,
                resolved_at,
                winner,
            )
        })
    }

    /// Most recent conflicts first
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.db
            .with_connection(|conn| SqliteRecordRepository::new(conn).list_conflicts(limit))
    }

    /// Persisted queue entries in enqueue order
    pub fn load_changes(&self) -> Result<Vec<ChangeEntry>> {
        self.db
            .with_connection(|conn| SqliteChangeRepository::new(conn).load_all())
    }

    /// Overwrite the persisted queue with `entries`
    pub fn replace_changes(&self, entries: &[ChangeEntry]) -> Result<()> {
        self.db
            .transaction(|tx| SqliteChangeRepository::new(tx).replace_all(entries))
    }

    fn make_room(
        &self,
        repo: &SqliteRecordRepository<'_>,
        incoming: &RecordId,
        size: u64,
    ) -> Result<Vec<RecordId>> {
        let used = u64::try_from(repo.used_bytes(Some(incoming))?).unwrap_or(0);
        let required = used.saturating_add(size);
        if required <= self.quota_bytes {
            return Ok(Vec::new());
        }

        let needed = required - self.quota_bytes;
        let candidates = repo.evictable(incoming)?;
        let available: u64 = candidates
            .iter()
            .map(|(_, bytes)| u64::try_from(*bytes).unwrap_or(0))
            .sum();
        if available < needed {
            tracing::warn!(
                record_id = %incoming,
                needed,
                available,
                "Local store quota exceeded"
            );
            return Err(Error::QuotaExceeded { needed, available });
        }

        let mut freed = 0_u64;
        let mut evicted = Vec::new();
        for (id, bytes) in candidates {
            if freed >= needed {
                break;
            }
            repo.remove(&id)?;
            freed += u64::try_from(bytes).unwrap_or(0);
            evicted.push(id);
        }
        Ok(evicted)
    }

    fn tombstone_expired(&self, deleted_at: i64, now: i64) -> bool {
        deleted_at.saturating_add(duration_millis(self.tombstone_ttl)) <= now
    }

    fn next_access(&self) -> i64 {
        self.access_clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl ChangeJournal for LocalRecordStore {
    fn save_change(&self, entry: &ChangeEntry) -> Result<()> {
        self.db
            .with_connection(|conn| SqliteChangeRepository::new(conn).save(entry))
    }

    fn remove_change(&self, record_id: &RecordId) -> Result<()> {
        self.db
            .with_connection(|conn| SqliteChangeRepository::new(conn).remove(record_id))
    }
}

fn live(stored: Option<StoredRecord>) -> Option<Record> {
    stored
        .filter(|stored| stored.deleted_at.is_none())
        .map(|stored| stored.record)
}

fn transition(record: &mut Record, to: SyncState) -> Result<()> {
    if !record.sync_state.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            record_id: record.id.as_str(),
            from: record.sync_state,
            to,
        });
    }
    record.sync_state = to;
    Ok(())
}
