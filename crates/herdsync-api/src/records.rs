//! In-memory record table behind the upsert endpoint

use std::collections::HashMap;

use chrono::Utc;
use herdsync_core::{RecordId, ServerRecord, TraceId, UpsertRequest};
use tokio::sync::Mutex;

use crate::error::AppError;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: ServerRecord,
    /// Trace of the write that produced `record`
    trace_id: TraceId,
}

/// What an upsert did to the table
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(ServerRecord),
    Updated(ServerRecord),
    /// Same trace and version as the stored write; nothing changed
    Replayed(ServerRecord),
}

impl UpsertOutcome {
    pub fn into_record(self) -> ServerRecord {
        match self {
            Self::Created(record) | Self::Updated(record) | Self::Replayed(record) => record,
        }
    }
}

#[derive(Default)]
pub struct RecordTable {
    records: Mutex<HashMap<RecordId, StoredRecord>>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one client write
    ///
    /// A write older than the stored version is rejected with the stored
    /// record unless `force` is set.
    pub async fn upsert(
        &self,
        id: RecordId,
        request: UpsertRequest,
    ) -> Result<UpsertOutcome, AppError> {
        if request.owner_id.trim().is_empty() {
            return Err(AppError::bad_request("ownerId must not be empty"));
        }
        if request.local_version < 1 {
            return Err(AppError::bad_request("localVersion must be >= 1"));
        }

        let mut records = self.records.lock().await;
        let previous = records.get(&id);

        if let Some(stored) = previous {
            if stored.trace_id == request.trace_id
                && stored.record.local_version == request.local_version
            {
                return Ok(UpsertOutcome::Replayed(stored.record.clone()));
            }
            if request.local_version < stored.record.local_version && !request.force {
                tracing::info!(
                    record_id = %id,
                    trace_id = %request.trace_id,
                    incoming_version = request.local_version,
                    stored_version = stored.record.local_version,
                    "Rejected stale write"
                );
                return Err(AppError::Conflict(Box::new(stored.record.clone())));
            }
        }

        let now = Utc::now().timestamp_millis();
        let updated_at = previous.map_or(now, |stored| now.max(stored.record.updated_at + 1));
        let created = previous.is_none();
        let record = ServerRecord {
            id,
            owner_id: request.owner_id,
            payload: request.payload,
            local_version: request.local_version,
            updated_at,
        };
        records.insert(
            id,
            StoredRecord {
                record: record.clone(),
                trace_id: request.trace_id,
            },
        );

        tracing::debug!(
            record_id = %id,
            trace_id = %request.trace_id,
            local_version = record.local_version,
            force = request.force,
            "Stored record"
        );
        Ok(if created {
            UpsertOutcome::Created(record)
        } else {
            UpsertOutcome::Updated(record)
        })
    }

    pub async fn get(&self, id: &RecordId) -> Option<ServerRecord> {
        self.records
            .lock()
            .await
            .get(id)
            .map(|stored| stored.record.clone())
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use herdsync_core::{Payload, Record};
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(record: &Record, trace_id: TraceId, force: bool) -> UpsertRequest {
        UpsertRequest::from_record(record, trace_id, force)
    }

    fn versioned(local_version: i64) -> Record {
        let mut record = Record::new("owner-1", Payload::new().with("name", "Bessie"));
        record.local_version = local_version;
        record
    }

    #[tokio::test]
    async fn first_write_creates_record() {
        let table = RecordTable::new();
        let record = versioned(1);

        let outcome = table
            .upsert(record.id, request(&record, TraceId::new(), false))
            .await
            .unwrap();
        let UpsertOutcome::Created(stored) = outcome else {
            panic!("expected a new record");
        };
        assert_eq!(stored.payload, record.payload);
        assert_eq!(stored.local_version, 1);
        assert_eq!(table.get(&record.id).await, Some(stored));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn replayed_write_is_idempotent() {
        let table = RecordTable::new();
        let record = versioned(1);
        let trace_id = TraceId::new();

        let first = table
            .upsert(record.id, request(&record, trace_id, false))
            .await
            .unwrap()
            .into_record();
        let replay = table
            .upsert(record.id, request(&record, trace_id, false))
            .await
            .unwrap();
        assert_eq!(replay, UpsertOutcome::Replayed(first));
    }

    #[tokio::test]
    async fn stale_write_conflicts_unless_forced() {
        let table = RecordTable::new();
        let newer = versioned(5);
        let stored = table
            .upsert(newer.id, request(&newer, TraceId::new(), false))
            .await
            .unwrap()
            .into_record();

        let mut stale = versioned(2);
        stale.id = newer.id;
        let err = table
            .upsert(stale.id, request(&stale, TraceId::new(), false))
            .await
            .unwrap_err();
        let AppError::Conflict(server) = err else {
            panic!("expected conflict, got {err:?}");
        };
        assert_eq!(*server, stored);

        let forced = table
            .upsert(stale.id, request(&stale, TraceId::new(), true))
            .await
            .unwrap();
        let UpsertOutcome::Updated(forced) = forced else {
            panic!("expected forced update");
        };
        assert_eq!(forced.local_version, 2);
        assert!(forced.updated_at > stored.updated_at);
    }

    #[tokio::test]
    async fn updated_at_strictly_increases() {
        let table = RecordTable::new();
        let mut record = versioned(1);
        let mut last = 0;
        for version in 1..=5 {
            record.local_version = version;
            let stored = table
                .upsert(record.id, request(&record, TraceId::new(), false))
                .await
                .unwrap()
                .into_record();
            assert!(stored.updated_at > last);
            last = stored.updated_at;
        }
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let table = RecordTable::new();
        let record = versioned(1);

        let mut missing_owner = request(&record, TraceId::new(), false);
        missing_owner.owner_id = "  ".to_string();
        assert!(matches!(
            table.upsert(record.id, missing_owner).await,
            Err(AppError::BadRequest(_))
        ));

        let mut bad_version = request(&record, TraceId::new(), false);
        bad_version.local_version = 0;
        assert!(matches!(
            table.upsert(record.id, bad_version).await,
            Err(AppError::BadRequest(_))
        ));
    }
}
