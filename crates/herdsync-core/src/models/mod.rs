//! Data models for herdsync

mod change;
mod payload;
mod record;
mod sync_conflict;
mod trace;

pub use change::{BufferedIntent, ChangeEntry, OperationKind};
pub use payload::{Payload, PayloadValue};
pub use record::{Record, RecordId, SyncState};
pub use sync_conflict::{ConflictWinner, SyncConflict};
pub use trace::{StatusEvent, TraceId, TraceStatus};
