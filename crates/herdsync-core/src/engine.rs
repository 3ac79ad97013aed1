//! `SyncEngine`: the handle the app constructs once and passes around.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::error::{Error, Result};
use crate::models::{
    ChangeEntry, OperationKind, Payload, Record, RecordId, StatusEvent, SyncConflict, SyncState,
    TraceId, TraceStatus,
};
use crate::queue::{Backoff, ChangeJournal, ChangeQueue, EnqueueOutcome};
use crate::remote::RemoteApi;
use crate::store::LocalRecordStore;
use crate::sync::{SyncContext, SyncWorker};
use crate::trace::{StatusSink, TraceCorrelator};
use crate::util::{duration_millis, unix_millis_now};

/// How long settled traces stay queryable
const TRACE_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Returned by every accepted local mutation
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub record: Record,
    /// Trace of this mutation; `status_for` resolves it even after coalescing
    pub trace_id: TraceId,
    /// Committed records evicted to make room
    pub evicted: Vec<RecordId>,
}

/// Snapshot for a "sync status" screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncSummary {
    pub pending: usize,
    pub in_flight: usize,
    pub committed: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Queue entries, parked ones included
    pub queued: usize,
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

/// What shutdown did to get the queue to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Workers still busy when the grace period ran out
    pub aborted_workers: usize,
    /// Claims released without an answer from the server
    pub released: usize,
    /// Records moved back to `Pending`
    pub reset_records: usize,
    /// Entries persisted for the next start
    pub queued: usize,
}

struct WorkerPool {
    stop: CancellationToken,
    abort: CancellationToken,
    workers: JoinSet<()>,
}

struct EngineInner {
    config: SyncConfig,
    ctx: Arc<SyncContext>,
    pool: Mutex<Option<WorkerPool>>,
}

/// Offline-first sync engine
///
/// Cheap to clone; all clones share one store, queue and worker pool.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open the local store and restore the queue left by the previous run
    pub fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
        auth: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let store = Arc::new(match &config.database_path {
            Some(path) => LocalRecordStore::open(path, config.quota_bytes, config.tombstone_ttl)?,
            None => LocalRecordStore::open_in_memory(config.quota_bytes, config.tombstone_ttl)?,
        });
        let journal: Arc<dyn ChangeJournal> = store.clone();
        let queue = Arc::new(
            ChangeQueue::new(Backoff::new(config.backoff.clone()), config.max_attempts)
                .with_journal(journal),
        );

        let ctx = Arc::new(SyncContext {
            resolver: ConflictResolver::new(store.clone()),
            store,
            queue,
            correlator: Arc::new(TraceCorrelator::new()),
            remote,
            auth,
            request_timeout: config.request_timeout,
            idle_poll_interval: config.idle_poll_interval,
        });

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                ctx,
                pool: Mutex::new(None),
            }),
        };
        engine.recover()?;
        Ok(engine)
    }

    fn recover(&self) -> Result<()> {
        let ctx = &self.inner.ctx;
        let now = unix_millis_now();

        ctx.store.purge_tombstones(now)?;
        let reset = ctx.store.reset_in_flight()?;
        let entries = ctx.store.load_changes()?;
        let restored = entries.len();
        ctx.queue.restore(entries)?;

        let mut requeued = 0;
        for record in ctx.store.list_by_state(SyncState::Pending)? {
            if ctx.queue.get(&record.id)?.is_some() {
                continue;
            }
            let entry = ChangeEntry::new(
                record.id,
                operation_kind(&record),
                record.local_version,
                ctx.correlator.new_trace_id(),
                now,
            );
            ctx.queue.enqueue(entry)?;
            requeued += 1;
        }

        if reset + restored + requeued > 0 {
            tracing::info!(reset, restored, requeued, "Recovered sync queue");
        }
        Ok(())
    }

    /// Spawn the worker pool on the current tokio runtime
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| Error::InvalidInput(format!("no tokio runtime: {error}")))?;
        let mut pool = self.inner.pool.lock()?;
        if pool.is_some() {
            return Ok(());
        }

        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let workers = self.inner.config.workers.max(1);
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let worker = SyncWorker::new(id, self.inner.ctx.clone(), stop.clone(), abort.clone());
            tasks.spawn_on(worker.run(), &runtime);
        }

        *pool = Some(WorkerPool {
            stop,
            abort,
            workers: tasks,
        });
        tracing::info!(workers, "Sync workers started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .pool
            .lock()
            .map(|pool| pool.is_some())
            .unwrap_or(false)
    }

    /// Stop the workers and persist everything still queued
    ///
    /// In-flight calls get `shutdown_grace` to finish; whatever is still
    /// running afterwards is aborted and its record returns to `Pending`.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        let ctx = &self.inner.ctx;
        let pool = self.inner.pool.lock()?.take();
        let mut report = ShutdownReport::default();

        if let Some(pool) = pool {
            pool.stop.cancel();
            ctx.queue.wake_all();

            let mut workers = pool.workers;
            let drained = tokio::time::timeout(self.inner.config.shutdown_grace, async {
                while workers.join_next().await.is_some() {}
            })
            .await
            .is_ok();

            if !drained {
                report.aborted_workers = workers.len();
                tracing::warn!(
                    aborted = report.aborted_workers,
                    "Shutdown grace period elapsed; aborting in-flight sync calls"
                );
                pool.abort.cancel();
                workers.abort_all();
                while workers.join_next().await.is_some() {}
            }
        }

        let released = ctx.queue.release_in_flight()?;
        report.released = released.len();
        report.reset_records = ctx.store.reset_in_flight()?;
        for record_id in released {
            if let Some(entry) = ctx.queue.get(&record_id)? {
                let status = ctx
                    .correlator
                    .status_for(entry.trace_id)
                    .unwrap_or(TraceStatus::Submitted);
                ctx.correlator
                    .emit(entry.trace_id, record_id, SyncState::Pending, status);
            }
        }

        let entries = ctx.queue.snapshot()?;
        ctx.store.replace_changes(&entries)?;
        report.queued = entries.len();

        tracing::info!(
            queued = report.queued,
            released = report.released,
            "Sync engine shut down"
        );
        Ok(report)
    }

    /// Store a new record and queue its creation
    pub fn create(&self, owner_id: impl Into<String>, payload: Payload) -> Result<SubmitReceipt> {
        self.submit(Record::new(owner_id, payload))
    }

    /// Replace the payload of an existing record and queue the update
    pub fn update(&self, id: &RecordId, payload: Payload) -> Result<SubmitReceipt> {
        let mut record = self.inner.ctx.store.get(id)?;
        record.payload = payload;
        self.submit(record)
    }

    /// Store a local mutation and queue it for delivery
    pub fn submit(&self, record: Record) -> Result<SubmitReceipt> {
        let ctx = &self.inner.ctx;
        let trace_id = ctx.correlator.new_trace_id();

        let outcome = ctx.store.put(record)?;
        let record = outcome.record;
        let entry = ChangeEntry::new(
            record.id,
            operation_kind(&record),
            record.local_version,
            trace_id,
            unix_millis_now(),
        );

        let enqueued = ctx.queue.enqueue(entry)?;
        let canonical = enqueued.canonical_trace(trace_id);
        if canonical != trace_id {
            ctx.correlator.link(trace_id, canonical);
        }
        let status = match enqueued {
            EnqueueOutcome::Coalesced { into } => ctx
                .correlator
                .status_for(into)
                .unwrap_or(TraceStatus::Submitted),
            _ => TraceStatus::Submitted,
        };
        ctx.correlator
            .emit(trace_id, record.id, record.sync_state, status);

        tracing::debug!(
            record_id = %record.id,
            trace_id = %trace_id,
            local_version = record.local_version,
            outcome = ?enqueued,
            "Queued local mutation"
        );
        Ok(SubmitReceipt {
            record,
            trace_id,
            evicted: outcome.evicted,
        })
    }

    pub fn get(&self, id: &RecordId) -> Result<Record> {
        self.inner.ctx.store.get(id)
    }

    /// Tombstone a record and drop its queued change
    pub fn delete(&self, id: &RecordId) -> Result<()> {
        let ctx = &self.inner.ctx;
        ctx.store.delete(id)?;
        ctx.queue.remove(id)?;
        Ok(())
    }

    /// User-triggered retry of a `Failed` record
    ///
    /// Returns the trace that reports the retry, or `None` if the record is
    /// not in `Failed`.
    pub fn retry_failed(&self, id: &RecordId) -> Result<Option<TraceId>> {
        let ctx = &self.inner.ctx;
        let record = ctx.store.get(id)?;
        if record.sync_state != SyncState::Failed {
            return Ok(None);
        }

        let now = unix_millis_now();
        ctx.store.set_sync_state(id, SyncState::Pending)?;
        let trace_id = if let Some(entry) = ctx.queue.retry(id, now)? {
            entry.trace_id
        } else {
            let trace_id = ctx.correlator.new_trace_id();
            let entry = ChangeEntry::new(
                record.id,
                operation_kind(&record),
                record.local_version,
                trace_id,
                now,
            );
            ctx.queue.enqueue(entry)?.canonical_trace(trace_id)
        };

        ctx.correlator
            .emit(trace_id, record.id, SyncState::Pending, TraceStatus::Submitted);
        tracing::info!(record_id = %id, trace_id = %trace_id, "Retrying failed record");
        Ok(Some(trace_id))
    }

    /// Retry every `Failed` record; returns how many were revived
    pub fn retry_all_failed(&self) -> Result<usize> {
        let failed = self.inner.ctx.store.list_by_state(SyncState::Failed)?;
        let mut retried = 0;
        for record in failed {
            if self.retry_failed(&record.id)?.is_some() {
                retried += 1;
            }
        }
        Ok(retried)
    }

    pub fn status_for(&self, trace_id: TraceId) -> Option<TraceStatus> {
        self.inner.ctx.correlator.status_for(trace_id)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StatusEvent> {
        self.inner.ctx.correlator.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn StatusSink>) {
        self.inner.ctx.correlator.add_sink(sink);
    }

    pub fn list_by_state(&self, state: SyncState) -> Result<Vec<Record>> {
        self.inner.ctx.store.list_by_state(state)
    }

    pub fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.inner.ctx.store.list_conflicts(limit)
    }

    /// Queue entries in enqueue order
    pub fn pending_changes(&self) -> Result<Vec<ChangeEntry>> {
        self.inner.ctx.queue.snapshot()
    }

    pub fn summary(&self) -> Result<SyncSummary> {
        let ctx = &self.inner.ctx;
        let counts = ctx.store.state_counts()?;
        let count = |state: SyncState| counts.get(&state).copied().unwrap_or(0);
        Ok(SyncSummary {
            pending: count(SyncState::Pending),
            in_flight: count(SyncState::InFlight),
            committed: count(SyncState::Committed),
            conflicted: count(SyncState::Conflicted),
            failed: count(SyncState::Failed),
            queued: ctx.queue.len()?,
            used_bytes: ctx.store.used_bytes()?,
            quota_bytes: ctx.store.quota_bytes(),
        })
    }

    /// Purge expired tombstones and forget old settled traces
    pub fn maintain(&self) -> Result<usize> {
        let ctx = &self.inner.ctx;
        let now = unix_millis_now();
        let purged = ctx.store.purge_tombstones(now)?;
        ctx.correlator
            .prune_settled(now.saturating_sub(duration_millis(TRACE_RETENTION)));
        Ok(purged)
    }
}

/// A record the server has never acknowledged still needs a create
fn operation_kind(record: &Record) -> OperationKind {
    if record.is_synced_once() {
        OperationKind::Update
    } else {
        OperationKind::Create
    }
}
