//! Error types for herdsync-core

use thiserror::Error;

use crate::models::SyncState;

/// Result type alias using herdsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in local store and queue operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found (or tombstoned)
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Record was deleted recently and cannot be written again yet
    #[error("Record is tombstoned: {0}")]
    Tombstoned(String),

    /// Local store is full and evicting committed records cannot free enough space
    #[error("Local store quota exceeded: need {needed} bytes, {available} bytes can be freed")]
    QuotaExceeded { needed: u64, available: u64 },

    /// Sync state change outside the record state machine
    #[error("Invalid sync state transition for {record_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        record_id: String,
        from: SyncState,
        to: SyncState,
    },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(error: std::sync::PoisonError<T>) -> Self {
        Self::Database(format!("lock poisoned: {error}"))
    }
}
