//! Remote upsert API consumed by the sync workers.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpRemoteApi, TRACE_ID_HEADER};

use crate::auth::AuthToken;
use crate::models::{Payload, Record, RecordId, TraceId};

/// Body of `PUT /records/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    pub owner_id: String,
    pub payload: Payload,
    pub local_version: i64,
    pub trace_id: TraceId,
    /// Overwrite the server copy even if it looks newer
    #[serde(default)]
    pub force: bool,
}

impl UpsertRequest {
    pub fn from_record(record: &Record, trace_id: TraceId, force: bool) -> Self {
        Self {
            owner_id: record.owner_id.clone(),
            payload: record.payload.clone(),
            local_version: record.local_version,
            trace_id,
            force,
        }
    }
}

/// The server's copy of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: RecordId,
    pub owner_id: String,
    pub payload: Payload,
    pub local_version: i64,
    /// Server clock (Unix ms)
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("Remote rejected the auth token")]
    Unauthorized,
    #[error("Remote holds a conflicting version updated at {}", .0.updated_at)]
    Conflict(Box<ServerRecord>),
    #[error("Remote server error: {message}")]
    Server { status: u16, message: String },
    #[error("Remote rejected the request: {message}")]
    Client { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Remote call timed out")]
    Timeout,
    #[error("Invalid remote response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether the same request may succeed later without changes
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Server { .. } | Self::Network(_) | Self::Timeout | Self::InvalidResponse(_) => {
                true
            }
            Self::Client { status, .. } => matches!(*status, 408 | 429),
            Self::Unauthorized | Self::Conflict(_) => false,
        }
    }
}

/// Idempotent record upsert, keyed by record id and trace id
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn upsert(
        &self,
        id: &RecordId,
        request: &UpsertRequest,
        token: &AuthToken,
    ) -> Result<ServerRecord, RemoteError>;
}
