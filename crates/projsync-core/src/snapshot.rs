//! Bulk reads of one parent's collection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use projsync_protocol::{Entity, SnapshotRequest, SnapshotResponse};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::capability::Capabilities;
use crate::error::SyncError;
use crate::singleflight::{FlightRole, Singleflight};

#[async_trait::async_trait]
pub trait SnapshotSource<E: Entity>: Send + Sync {
    async fn fetch(&self, request: SnapshotRequest) -> Result<SnapshotResponse<E>, SyncError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoadState {
    Idle,
    Loading,
    Ready { count: usize, loaded_at: DateTime<Utc> },
    Failed(SyncError),
}

impl LoadState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading)
    }
}

type SnapshotResult<E> = Result<Arc<Vec<E>>, SyncError>;

struct ParentState {
    tx: Arc<watch::Sender<LoadState>>,
    sessions: usize,
}

impl ParentState {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(LoadState::Idle).0),
            sessions: 0,
        }
    }
}

/// Fetches snapshots through a [`SnapshotSource`], one request per parent id
/// at a time. Callers that arrive while a fetch is pending share its result.
///
/// Load state is kept per parent while a session holds it through
/// [`retain`](Self::retain); the last [`release`](Self::release) drops it.
pub struct SnapshotLoader<E: Entity> {
    source: Arc<dyn SnapshotSource<E>>,
    capabilities: Arc<dyn Capabilities>,
    flights: Singleflight<SnapshotResult<E>>,
    states: Mutex<HashMap<String, ParentState>>,
}

impl<E: Entity> SnapshotLoader<E> {
    pub fn new(source: Arc<dyn SnapshotSource<E>>, capabilities: Arc<dyn Capabilities>) -> Self {
        Self {
            source,
            capabilities,
            flights: Singleflight::new("snapshot"),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Load state for `parent_id`; `Idle` until the first load starts.
    pub fn state(&self, parent_id: &str) -> watch::Receiver<LoadState> {
        self.sender(parent_id).subscribe()
    }

    pub fn retain(&self, parent_id: &str) {
        self.states
            .lock()
            .entry(parent_id.to_string())
            .or_insert_with(ParentState::new)
            .sessions += 1;
    }

    pub fn release(&self, parent_id: &str) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(parent_id) else {
            return;
        };
        state.sessions = state.sessions.saturating_sub(1);
        if state.sessions == 0 {
            states.remove(parent_id);
            debug!(parent_id, "load state released");
        }
    }

    /// Number of parent ids with load state held.
    pub fn tracked(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_loading(&self, parent_id: &str) -> bool {
        self.flights.is_pending(parent_id)
    }

    pub async fn load(&self, parent_id: &str) -> Result<Vec<E>, SyncError> {
        if !self.capabilities.can_view(E::KIND, parent_id) {
            debug!(parent_id, kind = E::KIND.as_str(), "snapshot view denied");
            return Err(SyncError::Forbidden(format!(
                "cannot view {} of {parent_id}",
                E::KIND.entity_set()
            )));
        }

        let state = self.sender(parent_id);
        let (role, flight) = self.flights.begin(parent_id, || {
            state.send_replace(LoadState::Loading);
            let source = Arc::clone(&self.source);
            let parent = parent_id.to_string();
            let state = Arc::clone(&state);
            async move {
                let result = source
                    .fetch(SnapshotRequest::new(parent.clone()))
                    .await
                    .map(|response| Arc::new(response.entities));
                match &result {
                    Ok(entities) => {
                        debug!(parent_id = %parent, count = entities.len(), "snapshot loaded");
                        state.send_replace(LoadState::Ready {
                            count: entities.len(),
                            loaded_at: Utc::now(),
                        });
                    }
                    Err(err) => {
                        warn!(
                            target: "projsync::snapshot",
                            parent_id = %parent,
                            error = %err,
                            "snapshot fetch failed"
                        );
                        state.send_replace(LoadState::Failed(err.clone()));
                    }
                }
                result
            }
        });
        if role == FlightRole::Follower {
            debug!(parent_id, "joined pending snapshot fetch");
        }
        flight.await.map(|entities| entities.as_ref().clone())
    }

    fn sender(&self, parent_id: &str) -> Arc<watch::Sender<LoadState>> {
        let mut states = self.states.lock();
        let state = states
            .entry(parent_id.to_string())
            .or_insert_with(ParentState::new);
        Arc::clone(&state.tx)
    }
}
