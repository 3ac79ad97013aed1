//! Database layer for herdsync

mod change_repository;
mod connection;
mod migrations;
mod record_repository;

pub use change_repository::SqliteChangeRepository;
pub use connection::Database;
pub use record_repository::{SqliteRecordRepository, StoredRecord};
