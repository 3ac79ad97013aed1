//! Record rows, tombstones and the conflict log

use std::collections::HashMap;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{ConflictWinner, Payload, Record, RecordId, SyncConflict, SyncState, TraceId};

const RECORD_COLUMNS: &str = "id, owner_id, payload, updated_at, modified_at, local_version, \
                              sync_state, size_bytes, deleted_at";

/// A record row as persisted, including bookkeeping columns
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: Record,
    pub size_bytes: i64,
    /// Set while the row is a tombstone
    pub deleted_at: Option<i64>,
}

/// `SQLite` access to the `records` and `sync_conflicts` tables
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Fetch a row, tombstones included
    pub fn get(&self, id: &RecordId) -> Result<Option<StoredRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"),
                params![id.as_str()],
                Self::parse_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or replace a live row, clearing any tombstone
    pub fn upsert(&self, record: &Record, size_bytes: i64, last_accessed: i64) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        self.conn.execute(
            "INSERT INTO records (id, owner_id, payload, updated_at, modified_at, local_version,
                 sync_state, size_bytes, last_accessed, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
             ON CONFLICT(id) DO UPDATE SET
                 owner_id = excluded.owner_id,
                 payload = excluded.payload,
                 updated_at = excluded.updated_at,
                 modified_at = excluded.modified_at,
                 local_version = excluded.local_version,
                 sync_state = excluded.sync_state,
                 size_bytes = excluded.size_bytes,
                 last_accessed = excluded.last_accessed,
                 deleted_at = NULL",
            params![
                record.id.as_str(),
                record.owner_id,
                payload,
                record.updated_at,
                record.modified_at,
                record.local_version,
                record.sync_state.as_str(),
                size_bytes,
                last_accessed,
            ],
        )?;
        Ok(())
    }

    /// Move a row to the most-recently-used end
    pub fn touch(&self, id: &RecordId, last_accessed: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET last_accessed = ? WHERE id = ?",
            params![last_accessed, id.as_str()],
        )?;
        Ok(())
    }

    pub fn set_state(&self, id: &RecordId, state: SyncState) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET sync_state = ? WHERE id = ? AND deleted_at IS NULL",
            params![state.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    /// Record the server-authoritative timestamp of the last acknowledgment
    pub fn set_updated_at(&self, id: &RecordId, updated_at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            params![updated_at, id.as_str()],
        )?;
        Ok(())
    }

    /// Bytes used by live rows, optionally ignoring one record
    pub fn used_bytes(&self, excluding: Option<&RecordId>) -> Result<i64> {
        let excluded = excluding.map(RecordId::as_str).unwrap_or_default();
        let used = self.conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM records
             WHERE deleted_at IS NULL AND id != ?",
            params![excluded],
            |row| row.get(0),
        )?;
        Ok(used)
    }

    /// Committed live rows, least recently used first
    pub fn evictable(&self, excluding: &RecordId) -> Result<Vec<(RecordId, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, size_bytes FROM records
             WHERE deleted_at IS NULL AND sync_state = ? AND id != ?
             ORDER BY last_accessed ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(
                params![SyncState::Committed.as_str(), excluding.as_str()],
                |row| Ok((parse_record_id(row, 0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drop a row entirely (eviction)
    pub fn remove(&self, id: &RecordId) -> Result<()> {
        self.conn
            .execute("DELETE FROM records WHERE id = ?", params![id.as_str()])?;
        Ok(())
    }

    /// Turn a live row into a tombstone; returns false if there was none
    pub fn tombstone(&self, id: &RecordId, deleted_at: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE records SET payload = '{}', size_bytes = 0, deleted_at = ?
             WHERE id = ? AND deleted_at IS NULL",
            params![deleted_at, id.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// Delete tombstones created at or before `cutoff`
    pub fn purge_tombstones(&self, cutoff: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM records WHERE deleted_at IS NOT NULL AND deleted_at <= ?",
            params![cutoff],
        )?;
        Ok(rows)
    }

    /// Live rows in the given state, oldest local mutation first
    pub fn list_by_state(&self, state: SyncState) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE deleted_at IS NULL AND sync_state = ?
             ORDER BY modified_at ASC, id ASC"
        ))?;
        let records = stmt
            .query_map(params![state.as_str()], Self::parse_row)?
            .map(|row| row.map(|stored| stored.record))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Number of live rows per state
    pub fn state_counts(&self) -> Result<HashMap<SyncState, usize>> {
        let mut stmt = self.conn.prepare(
            "SELECT sync_state, COUNT(*) FROM records
             WHERE deleted_at IS NULL
             GROUP BY sync_state",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((parse_sync_state(row, 0)?, row.get::<_, usize>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(counts)
    }

    /// Move every live row in `from` to `to`; returns the number of rows changed
    pub fn reset_states(&self, from: SyncState, to: SyncState) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE records SET sync_state = ? WHERE sync_state = ? AND deleted_at IS NULL",
            params![to.as_str(), from.as_str()],
        )?;
        Ok(rows)
    }

    /// Highest LRU stamp handed out so far
    pub fn max_last_accessed(&self) -> Result<i64> {
        let max = self.conn.query_row(
            "SELECT COALESCE(MAX(last_accessed), 0) FROM records",
            [],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Append an entry to the conflict log
    pub fn insert_conflict(
        &self,
        record_id: &RecordId,
        trace_id: &TraceId,
        local_modified_at: i64,
        server_updated_at: i64,
        resolved_at: i64,
        winner: ConflictWinner,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (record_id, trace_id, local_modified_at,
                 server_updated_at, resolved_at, strategy)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record_id.as_str(),
                trace_id.as_str(),
                local_modified_at,
                server_updated_at,
                resolved_at,
                winner.strategy(),
            ],
        )?;
        Ok(())
    }

    /// Most recent conflicts first
    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, record_id, trace_id, local_modified_at, server_updated_at,
                 resolved_at, strategy
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conflicts = stmt
            .query_map(params![limit], |row| {
                let trace: String = row.get(2)?;
                let strategy: String = row.get(6)?;
                Ok(SyncConflict {
                    id: row.get(0)?,
                    record_id: parse_record_id(row, 1)?,
                    trace_id: trace
                        .parse()
                        .map_err(|e| conversion_error(2, Box::new(e)))?,
                    local_modified_at: row.get(3)?,
                    server_updated_at: row.get(4)?,
                    resolved_at: row.get(5)?,
                    winner: strategy
                        .parse()
                        .map_err(|e: String| conversion_error(6, e.into()))?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    /// Parse a record from a database row selected with `RECORD_COLUMNS`
    fn parse_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
        let payload: String = row.get(2)?;
        let payload: Payload =
            serde_json::from_str(&payload).map_err(|e| conversion_error(2, Box::new(e)))?;

        Ok(StoredRecord {
            record: Record {
                id: parse_record_id(row, 0)?,
                owner_id: row.get(1)?,
                payload,
                updated_at: row.get(3)?,
                modified_at: row.get(4)?,
                local_version: row.get(5)?,
                sync_state: parse_sync_state(row, 6)?,
            },
            size_bytes: row.get(7)?,
            deleted_at: row.get(8)?,
        })
    }
}

pub(super) fn conversion_error(
    index: usize,
    error: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, error)
}

pub(super) fn parse_record_id(row: &Row<'_>, index: usize) -> rusqlite::Result<RecordId> {
    let raw: String = row.get(index)?;
    raw.parse()
        .map_err(|e| conversion_error(index, Box::new(e)))
}

fn parse_sync_state(row: &Row<'_>, index: usize) -> rusqlite::Result<SyncState> {
    let raw: String = row.get(index)?;
    raw.parse()
        .map_err(|e: String| conversion_error(index, e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn committed(name: &str) -> Record {
        let mut record = Record::new("owner-1", Payload::new().with("name", name));
        record.local_version = 1;
        record.sync_state = SyncState::Committed;
        record
    }

    #[test]
    fn test_upsert_and_get() {
        let db = setup();
        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            let record = committed("Bessie");
            repo.upsert(&record, 42, 1)?;

            let stored = repo.get(&record.id)?.unwrap();
            assert_eq!(stored.record, record);
            assert_eq!(stored.size_bytes, 42);
            assert_eq!(stored.deleted_at, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_tombstone_clears_payload_and_frees_space() {
        let db = setup();
        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            let record = committed("Clover");
            repo.upsert(&record, 100, 1)?;
            assert_eq!(repo.used_bytes(None)?, 100);

            assert!(repo.tombstone(&record.id, 5_000)?);
            assert!(!repo.tombstone(&record.id, 6_000)?);

            let stored = repo.get(&record.id)?.unwrap();
            assert_eq!(stored.deleted_at, Some(5_000));
            assert!(stored.record.payload.is_empty());
            assert_eq!(repo.used_bytes(None)?, 0);

            assert_eq!(repo.purge_tombstones(4_999)?, 0);
            assert_eq!(repo.purge_tombstones(5_000)?, 1);
            assert!(repo.get(&record.id)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_evictable_orders_committed_by_lru() {
        let db = setup();
        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            let old = committed("old");
            let recent = committed("recent");
            let mut pending = committed("pending");
            pending.sync_state = SyncState::Pending;

            repo.upsert(&recent, 10, 3)?;
            repo.upsert(&old, 10, 1)?;
            repo.upsert(&pending, 10, 0)?;

            let evictable = repo.evictable(&RecordId::new())?;
            let ids: Vec<RecordId> = evictable.into_iter().map(|(id, _)| id).collect();
            assert_eq!(ids, vec![old.id, recent.id]);

            repo.touch(&old.id, 9)?;
            let ids: Vec<RecordId> = repo
                .evictable(&RecordId::new())?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            assert_eq!(ids, vec![recent.id, old.id]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_state_counts_and_reset() {
        let db = setup();
        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            let a = committed("a");
            let mut b = committed("b");
            b.sync_state = SyncState::InFlight;
            repo.upsert(&a, 1, 1)?;
            repo.upsert(&b, 1, 2)?;

            assert_eq!(repo.reset_states(SyncState::InFlight, SyncState::Pending)?, 1);
            let counts = repo.state_counts()?;
            assert_eq!(counts.get(&SyncState::Committed), Some(&1));
            assert_eq!(counts.get(&SyncState::Pending), Some(&1));
            assert_eq!(counts.get(&SyncState::InFlight), None);
            assert_eq!(repo.list_by_state(SyncState::Pending)?[0].id, b.id);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_conflict_log_round_trip() {
        let db = setup();
        db.with_connection(|conn| {
            let repo = SqliteRecordRepository::new(conn);
            let record_id = RecordId::new();
            let trace_id = TraceId::new();
            repo.insert_conflict(&record_id, &trace_id, 100, 200, 300, ConflictWinner::Server)?;
            repo.insert_conflict(&record_id, &trace_id, 400, 300, 500, ConflictWinner::Local)?;

            let conflicts = repo.list_conflicts(10)?;
            assert_eq!(conflicts.len(), 2);
            assert_eq!(conflicts[0].winner, ConflictWinner::Local);
            assert_eq!(conflicts[1].winner, ConflictWinner::Server);
            assert_eq!(conflicts[1].record_id, record_id);
            assert_eq!(conflicts[1].trace_id, trace_id);
            assert_eq!(repo.list_conflicts(1)?.len(), 1);
            Ok(())
        })
        .unwrap();
    }
}
