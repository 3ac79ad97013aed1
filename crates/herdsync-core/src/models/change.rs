//! Queued mutation intents

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{RecordId, TraceId};

/// What the remote side has to do with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }

    /// Kind of the operation two coalesced intents collapse into.
    ///
    /// A create that has not reached the server stays a create.
    #[must_use]
    pub const fn coalesce(self, other: Self) -> Self {
        match (self, other) {
            (Self::Update, Self::Update) => Self::Update,
            _ => Self::Create,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

/// An intent that arrived while the entry's request was on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedIntent {
    pub operation_kind: OperationKind,
    pub local_version: i64,
    pub trace_id: TraceId,
}

/// A queued mutation intent for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub record_id: RecordId,
    pub operation_kind: OperationKind,
    /// Failed delivery attempts so far
    pub attempt_count: u32,
    /// Backoff deadline (Unix ms)
    pub next_eligible_at: i64,
    /// Trace of the earliest coalesced mutation
    pub trace_id: TraceId,
    /// Record version to send
    pub local_version: i64,
    /// Original enqueue time (Unix ms), kept across coalescing and retries
    pub enqueued_at: i64,
    /// Terminally failed; waits for a user-triggered retry
    pub parked: bool,
    pub buffered: Option<BufferedIntent>,
}

impl ChangeEntry {
    /// A fresh intent, eligible immediately
    #[must_use]
    pub const fn new(
        record_id: RecordId,
        operation_kind: OperationKind,
        local_version: i64,
        trace_id: TraceId,
        now: i64,
    ) -> Self {
        Self {
            record_id,
            operation_kind,
            attempt_count: 0,
            next_eligible_at: now,
            trace_id,
            local_version,
            enqueued_at: now,
            parked: false,
            buffered: None,
        }
    }

    #[must_use]
    pub const fn is_ready(&self, now: i64) -> bool {
        !self.parked && self.next_eligible_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_keeps_pending_create() {
        use OperationKind::{Create, Update};

        assert_eq!(Create.coalesce(Update), Create);
        assert_eq!(Update.coalesce(Create), Create);
        assert_eq!(Update.coalesce(Update), Update);
    }

    #[test]
    fn operation_kind_parses_column_value() {
        assert_eq!("create".parse::<OperationKind>(), Ok(OperationKind::Create));
        assert_eq!("update".parse::<OperationKind>(), Ok(OperationKind::Update));
        assert!("delete".parse::<OperationKind>().is_err());
    }

    #[test]
    fn new_entry_is_ready_now() {
        let entry = ChangeEntry::new(
            RecordId::new(),
            OperationKind::Create,
            1,
            TraceId::new(),
            1_000,
        );
        assert!(entry.is_ready(1_000));
        assert!(!entry.is_ready(999));
    }
}
