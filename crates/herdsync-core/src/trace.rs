//! Trace ids for user mutations and the status events they produce

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::models::{RecordId, StatusEvent, SyncState, TraceId, TraceStatus};
use crate::util::unix_millis_now;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Receives every record state transition, e.g. to drive save/error toasts
pub trait StatusSink: Send + Sync {
    fn on_status_change(&self, event: &StatusEvent);
}

#[derive(Debug, Clone, Copy)]
struct TraceEntry {
    status: TraceStatus,
    updated_at: i64,
}

#[derive(Default)]
struct TraceState {
    traces: HashMap<TraceId, TraceEntry>,
    /// Coalesced trace -> trace that now reports for it
    aliases: HashMap<TraceId, TraceId>,
}

impl TraceState {
    fn resolve(&self, trace_id: TraceId) -> TraceId {
        let mut current = trace_id;
        // Links always point at an older canonical, so the walk terminates.
        while let Some(next) = self.aliases.get(&current) {
            if *next == current {
                break;
            }
            current = *next;
        }
        current
    }
}

pub struct TraceCorrelator {
    state: Mutex<TraceState>,
    sinks: RwLock<Vec<Arc<dyn StatusSink>>>,
    events: broadcast::Sender<StatusEvent>,
}

impl TraceCorrelator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(TraceState::default()),
            sinks: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Fresh id for a new user mutation
    pub fn new_trace_id(&self) -> TraceId {
        TraceId::new()
    }

    /// Make `alias` report the status of `canonical`
    pub fn link(&self, alias: TraceId, canonical: TraceId) {
        let mut state = self.lock();
        let canonical = state.resolve(canonical);
        if alias == canonical {
            return;
        }
        state.traces.remove(&alias);
        for target in state.aliases.values_mut() {
            if *target == alias {
                *target = canonical;
            }
        }
        state.aliases.insert(alias, canonical);
        tracing::debug!(%alias, %canonical, "Linked coalesced trace");
    }

    /// Trace that reports for `trace_id`
    pub fn canonical(&self, trace_id: TraceId) -> TraceId {
        self.lock().resolve(trace_id)
    }

    pub fn status_for(&self, trace_id: TraceId) -> Option<TraceStatus> {
        let state = self.lock();
        let canonical = state.resolve(trace_id);
        state.traces.get(&canonical).map(|entry| entry.status)
    }

    /// Record a transition and publish it to sinks and subscribers
    pub fn emit(
        &self,
        trace_id: TraceId,
        record_id: RecordId,
        sync_state: SyncState,
        status: TraceStatus,
    ) -> StatusEvent {
        let at = unix_millis_now();
        let trace_id = {
            let mut state = self.lock();
            let canonical = state.resolve(trace_id);
            state.traces.insert(
                canonical,
                TraceEntry {
                    status,
                    updated_at: at,
                },
            );
            canonical
        };

        let event = StatusEvent {
            trace_id,
            record_id,
            sync_state,
            status,
            at,
        };
        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for sink in sinks {
            sink.on_status_change(&event);
        }
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        event
    }

    pub fn add_sink(&self, sink: Arc<dyn StatusSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Forget settled traces last updated at or before `cutoff`
    pub fn prune_settled(&self, cutoff: i64) -> usize {
        let mut state = self.lock();
        let before = state.traces.len();
        state
            .traces
            .retain(|_, entry| !(entry.status.is_settled() && entry.updated_at <= cutoff));
        let pruned = before - state.traces.len();

        let TraceState { traces, aliases } = &mut *state;
        aliases.retain(|_, canonical| traces.contains_key(canonical));
        pruned
    }

    fn lock(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TraceCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
