//! Record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Payload;

/// A unique identifier for a record, using UUID v7 (time-sortable)
///
/// Ordering follows the canonical hyphenated string form, so sorting by
/// `RecordId` is the same as sorting the ids lexically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a record stands in the sync state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local mutation waiting to be sent
    Pending,
    /// A request for this record is on the wire
    InFlight,
    /// Server acknowledged the latest local version
    Committed,
    /// Server answered with a conflicting version; resolver is running
    Conflicted,
    /// Parked after a fatal error or exhausted retries
    Failed,
}

impl SyncState {
    /// Every state, in declaration order
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InFlight,
        Self::Committed,
        Self::Conflicted,
        Self::Failed,
    ];

    /// Column value used by the local store
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Committed => "committed",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Pending | Self::InFlight | Self::Failed
            ) | (
                Self::InFlight,
                Self::Committed | Self::Pending | Self::Conflicted | Self::Failed
            ) | (
                Self::Conflicted,
                Self::Committed | Self::InFlight | Self::Pending | Self::Failed
            ) | (Self::Committed | Self::Failed, Self::Pending)
        )
    }

    /// Only committed records may be dropped to satisfy the quota
    #[must_use]
    pub const fn is_evictable(self) -> bool {
        matches!(self, Self::Committed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown sync state '{s}'"))
    }
}

/// A user-owned record (an animal, a journal entry, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Client-generated identifier
    pub id: RecordId,
    /// Owner set at creation
    pub owner_id: String,
    /// Domain fields, opaque to the sync core
    pub payload: Payload,
    /// Server-authoritative timestamp (Unix ms), `None` until first acknowledged
    pub updated_at: Option<i64>,
    /// Timestamp of the latest local mutation (Unix ms)
    pub modified_at: i64,
    /// Incremented on every local mutation
    pub local_version: i64,
    /// Position in the sync state machine
    pub sync_state: SyncState,
}

impl Record {
    /// Create a new, never-stored record for the given owner
    #[must_use]
    pub fn new(owner_id: impl Into<String>, payload: Payload) -> Self {
        Self::with_id(RecordId::new(), owner_id, payload)
    }

    /// Create a record with a caller-chosen id
    #[must_use]
    pub fn with_id(id: RecordId, owner_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            payload,
            updated_at: None,
            modified_at: chrono::Utc::now().timestamp_millis(),
            local_version: 0,
            sync_state: SyncState::Pending,
        }
    }

    /// Bytes charged against the local store quota
    #[must_use]
    pub fn storage_size(&self) -> u64 {
        let payload = self.payload.encoded_len();
        (payload + self.owner_id.len() + 36) as u64
    }

    /// Whether the server has ever acknowledged this record
    #[must_use]
    pub const fn is_synced_once(&self) -> bool {
        self.updated_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_unique() {
        let id1 = RecordId::new();
        let id2 = RecordId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_record_id_parse() {
        let id = RecordId::new();
        let parsed: RecordId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn record_id_order_matches_string_order() {
        let mut ids: Vec<RecordId> = (0..16).map(|_| RecordId::new()).collect();
        ids.reverse();
        let mut by_value = ids.clone();
        by_value.sort();
        let mut by_string = ids;
        by_string.sort_by_key(RecordId::as_str);
        assert_eq!(by_value, by_string);
    }

    #[test]
    fn test_record_new() {
        let record = Record::new("owner-1", Payload::new());
        assert_eq!(record.owner_id, "owner-1");
        assert_eq!(record.local_version, 0);
        assert_eq!(record.sync_state, SyncState::Pending);
        assert!(!record.is_synced_once());
    }

    #[test]
    fn sync_state_round_trips_through_column_value() {
        for state in SyncState::ALL {
            assert_eq!(state.as_str().parse::<SyncState>().unwrap(), state);
        }
        assert!("bogus".parse::<SyncState>().is_err());
    }

    #[test]
    fn sync_state_machine_follows_worker_flow() {
        use SyncState::{Committed, Conflicted, Failed, InFlight, Pending};

        assert!(Pending.can_transition_to(InFlight));
        assert!(InFlight.can_transition_to(Committed));
        assert!(InFlight.can_transition_to(Pending));
        assert!(InFlight.can_transition_to(Failed));
        assert!(InFlight.can_transition_to(Conflicted));
        assert!(Conflicted.can_transition_to(InFlight));
        assert!(Committed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Committed.can_transition_to(InFlight));
        assert!(!Failed.can_transition_to(InFlight));
        assert!(!Pending.can_transition_to(Committed));
        assert!(!InFlight.can_transition_to(InFlight));
    }

    #[test]
    fn only_committed_is_evictable() {
        let evictable: Vec<SyncState> = SyncState::ALL
            .into_iter()
            .filter(|state| state.is_evictable())
            .collect();
        assert_eq!(evictable, vec![SyncState::Committed]);
    }
}
