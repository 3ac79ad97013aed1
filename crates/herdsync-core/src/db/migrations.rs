//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        migrate(conn, 2, MIGRATION_V2)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Apply one migration atomically
fn migrate(conn: &Connection, version: i32, statements: &str) -> Result<()> {
    let script = format!(
        "BEGIN TRANSACTION;
         {statements}
         INSERT INTO schema_version (version) VALUES ({version});
         COMMIT;"
    );

    if let Err(e) = conn.execute_batch(&script) {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e.into());
    }

    tracing::info!("Migrated record store to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: records and the persisted change queue
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        updated_at INTEGER,
        modified_at INTEGER NOT NULL,
        local_version INTEGER NOT NULL,
        sync_state TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        last_accessed INTEGER NOT NULL,
        deleted_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_records_state_lru ON records(sync_state, last_accessed);
    CREATE INDEX IF NOT EXISTS idx_records_deleted ON records(deleted_at);
    CREATE TABLE IF NOT EXISTS change_queue (
        record_id TEXT PRIMARY KEY,
        operation_kind TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        next_eligible_at INTEGER NOT NULL,
        trace_id TEXT NOT NULL,
        local_version INTEGER NOT NULL,
        enqueued_at INTEGER NOT NULL,
        parked INTEGER NOT NULL DEFAULT 0,
        buffered TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_change_queue_enqueued ON change_queue(enqueued_at, record_id);
";

/// Version 2: last-write-wins conflict log
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_id TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        local_modified_at INTEGER NOT NULL,
        server_updated_at INTEGER NOT NULL,
        resolved_at INTEGER NOT NULL,
        strategy TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record_id ON sync_conflicts(record_id);
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC);
";
