//! Last-write-wins reconciliation of 409 answers

use std::sync::Arc;

use crate::error::Result;
use crate::models::{ConflictWinner, Record, TraceId};
use crate::remote::ServerRecord;
use crate::store::{LocalRecordStore, ServerApply};

/// Which side a conflict resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Server copy is strictly newer; it replaces the local edit
    AcceptServer,
    /// Local edit is newer or equally old; push it with `force`
    ForcePush,
}

/// Compare the local mutation time against the server's `updatedAt`
///
/// Ties go to the local side.
pub fn decide(local: &Record, server: &ServerRecord) -> Resolution {
    if server.updated_at > local.modified_at {
        Resolution::AcceptServer
    } else {
        Resolution::ForcePush
    }
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// Server copy applied (or skipped because the record moved on)
    Accepted(ServerApply),
    /// Caller must re-send the local version with `force = true`
    ForcePush,
}

pub struct ConflictResolver {
    store: Arc<LocalRecordStore>,
}

impl ConflictResolver {
    pub const fn new(store: Arc<LocalRecordStore>) -> Self {
        Self { store }
    }

    /// Resolve a conflict for the version in `sent` and log it
    pub fn resolve(
        &self,
        sent: &Record,
        server: &ServerRecord,
        trace_id: TraceId,
    ) -> Result<ConflictOutcome> {
        match decide(sent, server) {
            Resolution::AcceptServer => {
                let applied = self.store.overwrite_from_server(
                    &sent.id,
                    server.payload.clone(),
                    server.updated_at,
                    sent.local_version,
                )?;
                if matches!(applied, ServerApply::Committed(_)) {
                    tracing::warn!(
                        record_id = %sent.id,
                        trace_id = %trace_id,
                        local_modified_at = sent.modified_at,
                        server_updated_at = server.updated_at,
                        "Discarded local edit in favour of newer server version"
                    );
                    self.store.record_conflict(
                        &sent.id,
                        &trace_id,
                        sent.modified_at,
                        server.updated_at,
                        ConflictWinner::Server,
                    )?;
                }
                Ok(ConflictOutcome::Accepted(applied))
            }
            Resolution::ForcePush => {
                tracing::info!(
                    record_id = %sent.id,
                    trace_id = %trace_id,
                    local_modified_at = sent.modified_at,
                    server_updated_at = server.updated_at,
                    "Local edit wins conflict; force-pushing"
                );
                self.store.record_conflict(
                    &sent.id,
                    &trace_id,
                    sent.modified_at,
                    server.updated_at,
                    ConflictWinner::Local,
                )?;
                Ok(ConflictOutcome::ForcePush)
            }
        }
    }
}
