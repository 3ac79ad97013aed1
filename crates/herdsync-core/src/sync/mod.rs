//! Background workers draining the change queue against the remote API.
//!
//! Each worker loops: claim the first ready entry (which takes the
//! single-flight lock on its record), deliver it, then ack or nack. When
//! nothing is ready the worker parks on the queue's `Notify` until the
//! next backoff deadline, a new enqueue, or cancellation.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, AuthToken, TokenProvider};
use crate::conflict::{ConflictOutcome, ConflictResolver};
use crate::error::{Error, Result};
use crate::models::{ChangeEntry, Record, SyncState, TraceId, TraceStatus};
use crate::queue::{AckOutcome, ChangeQueue};
use crate::remote::{RemoteApi, RemoteError, ServerRecord, UpsertRequest};
use crate::store::{LocalRecordStore, ServerApply};
use crate::trace::TraceCorrelator;
use crate::util::unix_millis_now;

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Why a delivery attempt did not commit
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncFailure {
    #[error("Retryable network failure: {0}")]
    NetworkRetryable(String),
    /// Token refresh failed; the attempt is retried later
    #[error("Auth expired: {0}")]
    AuthExpired(String),
    #[error("Conflict with server version updated at {}", .0.updated_at)]
    Conflict(Box<ServerRecord>),
    /// Local store or journal write failed; retried like a network error
    #[error("Local store failure: {0}")]
    Local(String),
    #[error("Fatal sync failure: {0}")]
    Fatal(String),
}

impl SyncFailure {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkRetryable(_) | Self::AuthExpired(_) | Self::Local(_)
        )
    }
}

impl From<RemoteError> for SyncFailure {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Conflict(server) => Self::Conflict(server),
            RemoteError::Unauthorized => Self::AuthExpired(error.to_string()),
            error if error.is_retryable() => Self::NetworkRetryable(error.to_string()),
            error => Self::Fatal(error.to_string()),
        }
    }
}

/// Everything a worker needs, shared by the whole pool
pub(crate) struct SyncContext {
    pub store: Arc<LocalRecordStore>,
    pub queue: Arc<ChangeQueue>,
    pub correlator: Arc<TraceCorrelator>,
    pub resolver: ConflictResolver,
    pub remote: Arc<dyn RemoteApi>,
    pub auth: Arc<dyn TokenProvider>,
    pub request_timeout: Duration,
    pub idle_poll_interval: Duration,
}

enum SendError {
    Failed(SyncFailure),
    /// Shutdown grace period ran out mid-call
    Aborted,
}

impl From<SyncFailure> for SendError {
    fn from(failure: SyncFailure) -> Self {
        Self::Failed(failure)
    }
}

pub(crate) struct SyncWorker {
    id: usize,
    ctx: Arc<SyncContext>,
    /// Stop claiming new entries
    stop: CancellationToken,
    /// Abandon the call in progress
    abort: CancellationToken,
}

impl SyncWorker {
    pub const fn new(
        id: usize,
        ctx: Arc<SyncContext>,
        stop: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            id,
            ctx,
            stop,
            abort,
        }
    }

    pub async fn run(self) {
        tracing::debug!(worker = self.id, "Sync worker started");
        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let notified = self.ctx.queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.ctx.queue.claim_next(unix_millis_now()) {
                Ok(Some(entry)) => {
                    self.process(entry).await;
                    continue;
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(worker = self.id, "Failed to read change queue: {error}");
                }
            }

            let wait = self.wait_duration();
            tokio::select! {
                () = self.stop.cancelled() => break,
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!(worker = self.id, "Sync worker stopped");
    }

    fn wait_duration(&self) -> Duration {
        let idle = self.ctx.idle_poll_interval;
        match self.ctx.queue.next_deadline() {
            Ok(Some(deadline)) => {
                let millis = u64::try_from(deadline.saturating_sub(unix_millis_now())).unwrap_or(0);
                Duration::from_millis(millis).clamp(MIN_WAIT, idle.max(MIN_WAIT))
            }
            Ok(None) | Err(_) => idle,
        }
    }

    async fn process(&self, entry: ChangeEntry) {
        let record_id = entry.record_id;
        let Err(error) = self.deliver(&entry).await else {
            return;
        };
        tracing::error!(
            record_id = %record_id,
            trace_id = %entry.trace_id,
            "Sync attempt failed locally: {error}"
        );
        if let Err(error) = self.fail(&entry, &SyncFailure::Local(error.to_string())) {
            tracing::error!(record_id = %record_id, "Failed to reschedule entry: {error}");
        }
    }

    async fn deliver(&self, entry: &ChangeEntry) -> Result<()> {
        let ctx = &self.ctx;
        let record_id = entry.record_id;

        let Some(stored) = ctx.store.load(&record_id)? else {
            tracing::debug!(record_id = %record_id, "Dropping queued change for missing record");
            self.ack(entry)?;
            return Ok(());
        };
        if stored.deleted_at.is_some() {
            tracing::debug!(record_id = %record_id, "Dropping queued change for tombstoned record");
            self.ack(entry)?;
            return Ok(());
        }

        let record = match stored.record.sync_state {
            SyncState::Committed => {
                tracing::debug!(record_id = %record_id, "Dropping stale change for committed record");
                self.ack(entry)?;
                return Ok(());
            }
            SyncState::InFlight => stored.record,
            SyncState::Failed => {
                ctx.store.set_sync_state(&record_id, SyncState::Pending)?;
                ctx.store.set_sync_state(&record_id, SyncState::InFlight)?
            }
            SyncState::Pending | SyncState::Conflicted => {
                ctx.store.set_sync_state(&record_id, SyncState::InFlight)?
            }
        };

        let status = if entry.attempt_count > 0 {
            TraceStatus::Retrying
        } else {
            TraceStatus::Submitted
        };
        ctx.correlator
            .emit(entry.trace_id, record_id, SyncState::InFlight, status);
        tracing::debug!(
            record_id = %record_id,
            trace_id = %entry.trace_id,
            local_version = record.local_version,
            attempt = entry.attempt_count,
            "Sending record"
        );

        match self.send(&record, entry.trace_id, false).await {
            Ok(server) => self.commit(entry, &record, &server),
            Err(SendError::Aborted) => Ok(()),
            Err(SendError::Failed(SyncFailure::Conflict(server))) => {
                self.reconcile(entry, &record, &server).await
            }
            Err(SendError::Failed(failure)) => self.fail(entry, &failure),
        }
    }

    async fn reconcile(
        &self,
        entry: &ChangeEntry,
        sent: &Record,
        server: &ServerRecord,
    ) -> Result<()> {
        let ctx = &self.ctx;
        if let Some(record) = self.transition(sent, SyncState::Conflicted)? {
            ctx.correlator
                .emit(entry.trace_id, record.id, record.sync_state, TraceStatus::Retrying);
        }

        match ctx.resolver.resolve(sent, server, entry.trace_id)? {
            ConflictOutcome::Accepted(applied) => {
                if let ServerApply::Committed(record) = &applied {
                    ctx.correlator.emit(
                        entry.trace_id,
                        record.id,
                        SyncState::Committed,
                        TraceStatus::Committed,
                    );
                }
                self.ack(entry)?;
                Ok(())
            }
            ConflictOutcome::ForcePush => {
                if self.transition(sent, SyncState::InFlight)?.is_none() {
                    tracing::debug!(
                        record_id = %sent.id,
                        "Record deleted during conflict resolution; skipping force push"
                    );
                    return self.ack(entry);
                }
                match self.send(sent, entry.trace_id, true).await {
                    Ok(server) => self.commit(entry, sent, &server),
                    Err(SendError::Aborted) => Ok(()),
                    Err(SendError::Failed(SyncFailure::Conflict(_))) => self.fail(
                        entry,
                        &SyncFailure::Fatal("conflict persisted after force push".to_string()),
                    ),
                    Err(SendError::Failed(failure)) => self.fail(entry, &failure),
                }
            }
        }
    }

    fn commit(&self, entry: &ChangeEntry, sent: &Record, server: &ServerRecord) -> Result<()> {
        let ctx = &self.ctx;
        match ctx
            .store
            .apply_server_ack(&sent.id, sent.local_version, server.updated_at)?
        {
            ServerApply::Committed(record) => {
                tracing::info!(
                    record_id = %record.id,
                    trace_id = %entry.trace_id,
                    local_version = record.local_version,
                    "Record committed"
                );
                ctx.correlator.emit(
                    entry.trace_id,
                    record.id,
                    SyncState::Committed,
                    TraceStatus::Committed,
                );
            }
            ServerApply::Superseded(record) => {
                tracing::debug!(
                    record_id = %record.id,
                    sent_version = sent.local_version,
                    local_version = record.local_version,
                    "Delivered version superseded by a newer local edit"
                );
                ctx.correlator.emit(
                    entry.trace_id,
                    record.id,
                    record.sync_state,
                    TraceStatus::Committed,
                );
            }
            ServerApply::Gone => {}
        }
        self.ack(entry)
    }

    fn fail(&self, entry: &ChangeEntry, failure: &SyncFailure) -> Result<()> {
        let ctx = &self.ctx;
        let record_id = entry.record_id;
        let retryable = failure.is_retryable();

        let Some(outcome) = ctx.queue.nack(&record_id, retryable, unix_millis_now())? else {
            return Ok(());
        };
        if let Some(absorbed) = outcome.absorbed {
            ctx.correlator.link(absorbed, outcome.entry.trace_id);
        }

        let (state, status) = if outcome.parked {
            tracing::warn!(
                record_id = %record_id,
                trace_id = %outcome.entry.trace_id,
                attempts = outcome.entry.attempt_count,
                "Sync failed permanently: {failure}"
            );
            (SyncState::Failed, TraceStatus::Failed)
        } else {
            tracing::info!(
                record_id = %record_id,
                trace_id = %outcome.entry.trace_id,
                attempts = outcome.entry.attempt_count,
                next_eligible_at = outcome.entry.next_eligible_at,
                "Sync attempt failed, will retry: {failure}"
            );
            (SyncState::Pending, TraceStatus::Retrying)
        };

        match ctx.store.set_sync_state(&record_id, state) {
            Ok(record) => {
                ctx.correlator
                    .emit(outcome.entry.trace_id, record_id, record.sync_state, status);
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn ack(&self, entry: &ChangeEntry) -> Result<()> {
        if let AckOutcome::Promoted(next) = self.ctx.queue.ack(&entry.record_id, unix_millis_now())? {
            tracing::debug!(
                record_id = %next.record_id,
                trace_id = %next.trace_id,
                local_version = next.local_version,
                "Promoted change buffered during flight"
            );
        }
        Ok(())
    }

    /// Move the record to `to` unless it was deleted meanwhile
    fn transition(&self, sent: &Record, to: SyncState) -> Result<Option<Record>> {
        let Some(stored) = self.ctx.store.load(&sent.id)? else {
            return Ok(None);
        };
        if stored.deleted_at.is_some() {
            return Ok(None);
        }
        if stored.record.sync_state == to {
            return Ok(Some(stored.record));
        }
        if !stored.record.sync_state.can_transition_to(to) {
            return Ok(Some(stored.record));
        }
        self.ctx.store.set_sync_state(&sent.id, to).map(Some)
    }

    /// One upsert, with at most one token refresh
    async fn send(
        &self,
        record: &Record,
        trace_id: TraceId,
        force: bool,
    ) -> std::result::Result<ServerRecord, SendError> {
        let mut refreshed = false;
        let mut token = match self.ctx.auth.token().await {
            Ok(token) => token,
            Err(AuthError::Expired) => {
                refreshed = true;
                self.refresh().await?
            }
            Err(error @ AuthError::NotConfigured) => {
                return Err(SyncFailure::Fatal(error.to_string()).into());
            }
            Err(error) => return Err(SyncFailure::AuthExpired(error.to_string()).into()),
        };

        let request = UpsertRequest::from_record(record, trace_id, force);
        loop {
            match self.call(record, &request, &token).await? {
                Ok(server) => return Ok(server),
                Err(RemoteError::Unauthorized) if !refreshed => {
                    refreshed = true;
                    token = self.refresh().await?;
                }
                Err(RemoteError::Unauthorized) => {
                    return Err(SyncFailure::Fatal(
                        "auth token rejected after refresh".to_string(),
                    )
                    .into());
                }
                Err(error) => return Err(SyncFailure::from(error).into()),
            }
        }
    }

    async fn refresh(&self) -> std::result::Result<AuthToken, SyncFailure> {
        match self.ctx.auth.refresh().await {
            Ok(token) => {
                tracing::info!(worker = self.id, "Refreshed auth token");
                Ok(token)
            }
            Err(error) => {
                tracing::warn!(worker = self.id, "Auth token refresh failed: {error}");
                Err(SyncFailure::AuthExpired(error.to_string()))
            }
        }
    }

    async fn call(
        &self,
        record: &Record,
        request: &UpsertRequest,
        token: &AuthToken,
    ) -> std::result::Result<std::result::Result<ServerRecord, RemoteError>, SendError> {
        let upsert = tokio::time::timeout(
            self.ctx.request_timeout,
            self.ctx.remote.upsert(&record.id, request, token),
        );
        tokio::select! {
            () = self.abort.cancelled() => Err(SendError::Aborted),
            result = upsert => Ok(result.unwrap_or(Err(RemoteError::Timeout))),
        }
    }
}
