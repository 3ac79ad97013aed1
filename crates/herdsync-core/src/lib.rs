//! herdsync-core - offline-first record sync engine
//!
//! Local mutations land in a SQLite-backed record store and a coalescing
//! change queue; a pool of background workers delivers them to a remote
//! upsert API with backoff, token refresh and last-write-wins conflict
//! resolution. Every step is reported per trace id.

pub mod auth;
pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
pub mod trace;
mod util;


pub use auth::{AuthError, AuthToken, StaticTokenProvider, TokenProvider};
pub use config::{BackoffConfig, ConfigError, SyncConfig};
pub use engine::{ShutdownReport, SubmitReceipt, SyncEngine, SyncSummary};
pub use error::{Error, Result};
pub use models::{
    BufferedIntent, ChangeEntry, ConflictWinner, OperationKind, Payload, PayloadValue, Record,
    RecordId, StatusEvent, SyncConflict, SyncState, TraceId, TraceStatus,
};
pub use remote::{
    HttpRemoteApi, RemoteApi, RemoteError, ServerRecord, UpsertRequest, TRACE_ID_HEADER,
};
pub use store::LocalRecordStore;
pub use sync::SyncFailure;
pub use trace::{StatusSink, TraceCorrelator};
