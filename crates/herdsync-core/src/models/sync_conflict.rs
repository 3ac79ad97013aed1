//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{RecordId, TraceId};

/// Which side a last-write-wins resolution kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    /// Server copy overwrote the local edit
    Server,
    /// Local edit was force-pushed
    Local,
}

impl ConflictWinner {
    #[must_use]
    pub const fn strategy(self) -> &'static str {
        match self {
            Self::Server => "lww-server",
            Self::Local => "lww-local",
        }
    }
}

impl fmt::Display for ConflictWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy())
    }
}

impl FromStr for ConflictWinner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lww-server" => Ok(Self::Server),
            "lww-local" => Ok(Self::Local),
            other => Err(format!("unknown conflict strategy '{other}'")),
        }
    }
}

/// Recorded sync conflict resolved by last-write-wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Record involved in the conflict
    pub record_id: RecordId,
    /// Trace of the local mutation that conflicted
    pub trace_id: TraceId,
    /// Local mutation timestamp (Unix ms)
    pub local_modified_at: i64,
    /// Server version's timestamp (Unix ms)
    pub server_updated_at: i64,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: i64,
    pub winner: ConflictWinner,
}
