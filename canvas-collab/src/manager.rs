//! Session manager: at most one live session per canvas, shared through
//! reference-counted handles.
//!
//! ```text
//! acquire(id) ──► slots[id]
//!                   ├─ Live{refs}     ──► refs += 1, new handle
//!                   ├─ Opening        ──► wait, retry (reopen if the opener is gone)
//!                   ├─ TearingDown    ──► wait, retry
//!                   └─ (none)         ──► Opening ─► load from store ─► Live{1}
//!
//! release(handle) ──► refs -= 1 ──► 0 ──► TearingDown ─► shutdown ─► (none)
//! ```
//!
//! Loading and teardown run outside the slot map lock, so different canvases
//! never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canvas_core::{
    CanvasId, ChangeBatch, Credential, Intent, NodeId, NodeView, Operation, Replica, ReplicaId,
    StateVector,
};
use futures_util::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use crate::config::CollabConfig;
use crate::error::SyncError;
use crate::protocol::AwarenessState;
use crate::session::{ConnectionState, SessionStore, SyncSession};
use crate::storage::{CanvasStore, LoadedCanvas, StoreError};
use crate::transport::{Connector, WsConnector};

enum Slot {
    Live {
        session: Arc<SyncSession>,
        refs: usize,
    },
    Opening(watch::Receiver<bool>),
    TearingDown(watch::Receiver<bool>),
}

struct ManagerInner {
    config: CollabConfig,
    connector: Arc<dyn Connector>,
    store: Option<Arc<CanvasStore>>,
    slots: tokio::sync::Mutex<HashMap<CanvasId, Slot>>,
}

/// Owns every session of the process. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager, opening the configured store. A store that fails
    /// to open leaves every session in memory.
    pub fn new(config: CollabConfig, connector: Arc<dyn Connector>) -> Self {
        let store = match &config.store {
            Some(store_config) => match CanvasStore::open(store_config.clone()) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    log::error!(
                        "{}; sessions will run in memory",
                        SyncError::PersistenceUnavailable(e)
                    );
                    None
                }
            },
            None => None,
        };
        Self::with_store(config, connector, store)
    }

    /// Manager connecting over WebSockets to `config.server_url`.
    pub fn websocket(config: CollabConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.server_url.clone()));
        Self::new(config, connector)
    }

    pub fn with_store(
        config: CollabConfig,
        connector: Arc<dyn Connector>,
        store: Option<Arc<CanvasStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                store,
                slots: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> Option<&Arc<CanvasStore>> {
        self.inner.store.as_ref()
    }

    /// Live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Live { .. }))
            .count()
    }

    /// Get a handle to the session for `canvas_id`, creating it on first use.
    /// Only an invalid id or an empty credential fail; storage and network
    /// trouble is absorbed by the session.
    pub async fn acquire(
        &self,
        canvas_id: &str,
        credential: Credential,
    ) -> Result<SessionHandle, SyncError> {
        let canvas = CanvasId::parse(canvas_id)?;
        if credential.is_empty() {
            return Err(SyncError::MissingCredential);
        }

        let opened = loop {
            let mut slots = self.inner.slots.lock().await;
            let busy = match slots.get_mut(&canvas) {
                Some(Slot::Live { session, refs }) => {
                    *refs += 1;
                    log::debug!("Session for {canvas} now has {refs} handles");
                    return Ok(SessionHandle::new(self.clone(), session.clone()));
                }
                Some(Slot::Opening(done)) | Some(Slot::TearingDown(done))
                    if done.has_changed().is_ok() =>
                {
                    Some(done.clone())
                }
                Some(_) => {
                    log::warn!("Previous owner of {canvas} went away; reopening");
                    None
                }
                None => None,
            };
            if let Some(mut busy) = busy {
                drop(slots);
                log::debug!("Waiting for {canvas} to settle");
                // A closed channel also means settled; the slot is re-checked
                let _ = busy.wait_for(|done| *done).await;
                continue;
            }
            let (tx, rx) = watch::channel(false);
            slots.insert(canvas.clone(), Slot::Opening(rx));
            break tx;
        };

        // The opener owns the new reference and hands it out as a handle, so
        // a caller that stops waiting drops a handle that releases itself.
        let manager = self.clone();
        let key = canvas.clone();
        let task = tokio::spawn(async move {
            let session = Arc::new(manager.open_session(&key, credential).await);
            manager.inner.slots.lock().await.insert(
                key,
                Slot::Live {
                    session: session.clone(),
                    refs: 1,
                },
            );
            let _ = opened.send(true);
            SessionHandle::new(manager, session)
        });
        task.await
            .map_err(|e| SyncError::Transport(format!("session start for {canvas} failed: {e}")))
    }

    async fn open_session(&self, canvas: &CanvasId, credential: Credential) -> SyncSession {
        let replica_id = ReplicaId::random();
        let (replica, store) = match self.inner.store.clone() {
            None => (Replica::new(replica_id), None),
            Some(store) => self.restore(canvas, replica_id, store).await,
        };
        SyncSession::start(
            canvas.clone(),
            credential,
            replica,
            self.inner.connector.clone(),
            store,
            &self.inner.config,
        )
    }

    async fn restore(
        &self,
        canvas: &CanvasId,
        replica_id: ReplicaId,
        store: Arc<CanvasStore>,
    ) -> (Replica, Option<SessionStore>) {
        let fresh = |store| {
            Some(SessionStore {
                store,
                pending_records: 0,
                last_synced: StateVector::new(),
            })
        };
        let loader = store.clone();
        let key = canvas.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&key))
            .await
            .unwrap_or_else(|e| Err(StoreError::DatabaseError(format!("load task failed: {e}"))));

        match loaded {
            Ok(Some(loaded)) => {
                let (replica, session_store) = restore_replica(replica_id, loaded, store);
                log::info!(
                    "Restored {canvas} from cache ({} ops, {} pending records)",
                    replica.log().len(),
                    session_store.pending_records
                );
                (replica, Some(session_store))
            }
            Ok(None) => (Replica::new(replica_id), fresh(store)),
            Err(StoreError::Corrupt(msg)) => {
                log::warn!(
                    "{}; discarding cache for {canvas} and resyncing",
                    SyncError::CorruptLog(msg)
                );
                let cleaner = store.clone();
                let key = canvas.clone();
                let discarded = tokio::task::spawn_blocking(move || cleaner.discard(&key)).await;
                match discarded {
                    Ok(Ok(())) => (Replica::new(replica_id), fresh(store)),
                    Ok(Err(e)) => {
                        log::error!("Discarding cache for {canvas} failed: {e}");
                        (Replica::new(replica_id), None)
                    }
                    Err(e) => {
                        log::error!("Discard task for {canvas} failed: {e}");
                        (Replica::new(replica_id), None)
                    }
                }
            }
            Err(e) => {
                log::error!(
                    "{}; {canvas} runs in memory",
                    SyncError::PersistenceUnavailable(e)
                );
                (Replica::new(replica_id), None)
            }
        }
    }

    /// Drop one reference; the last one tears the session down. Returns
    /// once teardown has finished.
    async fn release(&self, canvas: &CanvasId) {
        let (session, done) = {
            let mut slots = self.inner.slots.lock().await;
            let Some(Slot::Live { refs, .. }) = slots.get_mut(canvas) else {
                log::warn!("Release of {canvas} without a live session");
                return;
            };
            *refs -= 1;
            if *refs > 0 {
                return;
            }
            let (done, rx) = watch::channel(false);
            let Some(Slot::Live { session, .. }) =
                slots.insert(canvas.clone(), Slot::TearingDown(rx))
            else {
                return;
            };
            (session, done)
        };

        log::info!("Tearing down session for {canvas}");
        // Spawned so teardown completes even if the caller goes away
        let manager = self.clone();
        let key = canvas.clone();
        let task = tokio::spawn(async move {
            session.shutdown().await;
            manager.inner.slots.lock().await.remove(&key);
            let _ = done.send(true);
        });
        if let Err(e) = task.await {
            log::error!("Teardown of {canvas} failed: {e}");
            let mut slots = self.inner.slots.lock().await;
            if matches!(slots.get(canvas), Some(Slot::TearingDown(done)) if done.has_changed().is_err())
            {
                slots.remove(canvas);
            }
        }
    }
}

fn restore_replica(
    replica_id: ReplicaId,
    loaded: LoadedCanvas,
    store: Arc<CanvasStore>,
) -> (Replica, SessionStore) {
    let LoadedCanvas {
        snapshot,
        operations,
        session,
        metadata,
    } = loaded;
    let mut replica = Replica::from_snapshot(replica_id, snapshot);
    let report = replica.integrate(operations);
    if report.rejected > 0 {
        log::warn!("Dropped {} unreadable cached ops", report.rejected);
    }
    replica.take_changes(canvas_core::ChangeOrigin::Restore);
    let session_store = SessionStore {
        store,
        pending_records: metadata.pending_records(),
        last_synced: session.map(|s| s.last_synced).unwrap_or_default(),
    };
    (replica, session_store)
}

// ─── Handle ───────────────────────────────────────────────────────────

/// Reference to a shared canvas session. Release it explicitly with
/// [`SessionHandle::release`]; dropping it schedules the release on the
/// current runtime.
pub struct SessionHandle {
    manager: SessionManager,
    session: Arc<SyncSession>,
    released: bool,
}

impl SessionHandle {
    fn new(manager: SessionManager, session: Arc<SyncSession>) -> Self {
        Self {
            manager,
            session,
            released: false,
        }
    }

    pub fn canvas_id(&self) -> &CanvasId {
        self.session.canvas_id()
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.session.replica_id()
    }

    pub fn local_mutate(&self, intent: Intent) -> Result<Operation, SyncError> {
        self.session.local_mutate(intent)
    }

    pub fn query(&self, node: NodeId) -> Option<NodeView> {
        self.session.query(node)
    }

    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        self.session.children(parent)
    }

    /// Every visible node, depth first from the root.
    pub fn visible_nodes(&self) -> Vec<NodeView> {
        self.session.visible_nodes()
    }

    pub fn state_vector(&self) -> StateVector {
        self.session.state_vector()
    }

    /// Change batches from now on, one per local mutation or remote delta.
    /// A subscriber that falls behind skips the batches it missed.
    pub fn subscribe(&self) -> impl Stream<Item = ChangeBatch> + Send + 'static {
        let rx = self.session.subscribe();
        futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(batch) => return Some((batch, rx)),
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Change subscriber lagged; skipped {n} batches");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.connection_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.watch_state()
    }

    pub fn set_awareness(&self, state: AwarenessState) {
        self.session.set_awareness(state);
    }

    /// Presence of the other peers on this canvas.
    pub fn presence(&self) -> HashMap<ReplicaId, AwarenessState> {
        self.session.presence()
    }

    pub async fn force_sync(&self, timeout: Duration) -> Result<(), SyncError> {
        self.session.force_sync(timeout).await
    }

    /// Wait until queued local writes reached the store.
    pub async fn flush(&self) {
        self.session.flush_persistence().await;
    }

    pub fn is_persistence_degraded(&self) -> bool {
        self.session.is_persistence_degraded()
    }

    /// Give the handle back. The last release tears the session down and
    /// returns after it finished.
    pub async fn release(mut self) {
        self.released = true;
        let canvas = self.session.canvas_id().clone();
        self.manager.release(&canvas).await;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let canvas = self.session.canvas_id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.manager.clone();
                runtime.spawn(async move { manager.release(&canvas).await });
            }
            Err(_) => log::warn!("Handle for {canvas} dropped outside a runtime; session leaks"),
        }
    }
}
