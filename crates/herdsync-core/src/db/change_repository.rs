//! Persisted change queue

use rusqlite::{params, Connection, Row};

use super::record_repository::{conversion_error, parse_record_id};
use crate::error::Result;
use crate::models::{BufferedIntent, ChangeEntry, RecordId};

/// `SQLite` access to the `change_queue` table
pub struct SqliteChangeRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteChangeRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert or replace the entry for its record
    pub fn save(&self, entry: &ChangeEntry) -> Result<()> {
        let buffered = entry
            .buffered
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO change_queue (record_id, operation_kind, attempt_count,
                 next_eligible_at, trace_id, local_version, enqueued_at, parked, buffered)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.record_id.as_str(),
                entry.operation_kind.as_str(),
                entry.attempt_count,
                entry.next_eligible_at,
                entry.trace_id.as_str(),
                entry.local_version,
                entry.enqueued_at,
                i32::from(entry.parked),
                buffered,
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, record_id: &RecordId) -> Result<()> {
        self.conn.execute(
            "DELETE FROM change_queue WHERE record_id = ?",
            params![record_id.as_str()],
        )?;
        Ok(())
    }

    /// All entries in enqueue order
    pub fn load_all(&self) -> Result<Vec<ChangeEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, operation_kind, attempt_count, next_eligible_at, trace_id,
                 local_version, enqueued_at, parked, buffered
             FROM change_queue
             ORDER BY enqueued_at ASC, record_id ASC",
        )?;
        let entries = stmt
            .query_map([], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Replace the whole table with `entries`
    pub fn replace_all(&self, entries: &[ChangeEntry]) -> Result<()> {
        self.conn.execute("DELETE FROM change_queue", [])?;
        for entry in entries {
            self.save(entry)?;
        }
        Ok(())
    }

    fn parse_entry(row: &Row<'_>) -> rusqlite::Result<ChangeEntry> {
        let kind: String = row.get(1)?;
        let trace: String = row.get(4)?;
        let buffered: Option<String> = row.get(8)?;
        let buffered = buffered
            .map(|raw| serde_json::from_str::<BufferedIntent>(&raw))
            .transpose()
            .map_err(|e| conversion_error(8, Box::new(e)))?;

        Ok(ChangeEntry {
            record_id: parse_record_id(row, 0)?,
            operation_kind: kind
                .parse()
                .map_err(|e: String| conversion_error(1, e.into()))?,
            attempt_count: row.get(2)?,
            next_eligible_at: row.get(3)?,
            trace_id: trace
                .parse()
                .map_err(|e| conversion_error(4, Box::new(e)))?,
            local_version: row.get(5)?,
            enqueued_at: row.get(6)?,
            parked: row.get::<_, i32>(7)? != 0,
            buffered,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Database;
    use crate::models::{OperationKind, TraceId};

    #[test]
    fn test_save_load_and_remove() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let repo = SqliteChangeRepository::new(conn);
            let mut later = ChangeEntry::new(
                RecordId::new(),
                OperationKind::Update,
                3,
                TraceId::new(),
                2_000,
            );
            later.attempt_count = 2;
            later.parked = true;
            later.buffered = Some(BufferedIntent {
                operation_kind: OperationKind::Update,
                local_version: 4,
                trace_id: TraceId::new(),
            });
            let earlier = ChangeEntry::new(
                RecordId::new(),
                OperationKind::Create,
                1,
                TraceId::new(),
                1_000,
            );

            repo.save(&later)?;
            repo.save(&earlier)?;
            assert_eq!(repo.load_all()?, vec![earlier.clone(), later.clone()]);

            repo.remove(&earlier.record_id)?;
            assert_eq!(repo.load_all()?, vec![later]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_replace_all() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let repo = SqliteChangeRepository::new(conn);
            let stale = ChangeEntry::new(
                RecordId::new(),
                OperationKind::Create,
                1,
                TraceId::new(),
                1,
            );
            repo.save(&stale)?;

            let fresh = ChangeEntry::new(
                RecordId::new(),
                OperationKind::Update,
                7,
                TraceId::new(),
                2,
            );
            repo.replace_all(std::slice::from_ref(&fresh))?;
            assert_eq!(repo.load_all()?, vec![fresh]);
            Ok(())
        })
        .unwrap();
    }
}
