//! Background persistence for one session.
//!
//! ```text
//! local_mutate ──► PersistHandle::append ──► mpsc ──► PersistWorker
//!                                                        │ spawn_blocking
//!                                                        ▼
//!                                                   CanvasStore
//!                                        append / save_snapshot / save_session
//! ```
//!
//! Mutations never wait on disk. A failed write keeps its operations
//! queued and the worker retries on the next command or retry tick; while
//! writes fail the session is degraded to in-memory only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use canvas_core::{CanvasId, Operation, Replica, ReplicaId, StateVector};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::PersistConfig;
use crate::session::ConnectionState;
use crate::storage::{CanvasStore, StoreError};

const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Last known sync position of a session, stored next to the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub canvas_id: CanvasId,
    pub replica_id: ReplicaId,
    pub state: ConnectionState,
    /// Frontier last acknowledged by the authority
    pub last_synced: StateVector,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl SessionRecord {
    pub fn new(
        canvas_id: CanvasId,
        replica_id: ReplicaId,
        state: ConnectionState,
        last_synced: StateVector,
    ) -> Self {
        let updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            canvas_id,
            replica_id,
            state,
            last_synced,
            updated_at,
        }
    }
}

enum PersistCommand {
    Append(Vec<Operation>),
    Session(SessionRecord),
    Flush(oneshot::Sender<()>),
    Close,
}

/// Sending side of a session's persistence worker. Cheap to clone.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
    degraded: Arc<AtomicBool>,
}

impl PersistHandle {
    /// Handle whose worker is gone; every command is dropped.
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self {
            tx,
            degraded: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn append(&self, ops: Vec<Operation>) {
        if ops.is_empty() {
            return;
        }
        if self.tx.send(PersistCommand::Append(ops)).is_err() {
            log::trace!("Persistence worker gone; keeping ops in memory only");
        }
    }

    pub fn record_session(&self, record: SessionRecord) {
        let _ = self.tx.send(PersistCommand::Session(record));
    }

    /// Wait until everything queued so far has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Write what is pending, save a final snapshot and stop the worker.
    pub fn close(&self) {
        let _ = self.tx.send(PersistCommand::Close);
    }

    /// Whether the last write attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

/// Owns all store writes of one session.
pub struct PersistWorker {
    store: Arc<CanvasStore>,
    canvas: CanvasId,
    replica: Arc<Mutex<Replica>>,
    config: PersistConfig,
    rx: mpsc::UnboundedReceiver<PersistCommand>,
    degraded: Arc<AtomicBool>,
    /// Ops not yet durably appended
    pending: Vec<Operation>,
    /// Log records written since the last snapshot
    records: u64,
}

impl PersistWorker {
    /// Start the worker. `initial_records` is the log length left over
    /// from the previous run.
    pub fn spawn(
        store: Arc<CanvasStore>,
        canvas: CanvasId,
        replica: Arc<Mutex<Replica>>,
        config: PersistConfig,
        initial_records: u64,
    ) -> (PersistHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let degraded = Arc::new(AtomicBool::new(false));
        let worker = Self {
            store,
            canvas,
            replica,
            config,
            rx,
            degraded: degraded.clone(),
            pending: Vec::new(),
            records: initial_records,
        };
        let task = tokio::spawn(worker.run());
        (PersistHandle { tx, degraded }, task)
    }

    async fn run(mut self) {
        log::debug!("Persistence worker started for {}", self.canvas);
        loop {
            let retry = !self.pending.is_empty();
            let cmd = tokio::select! {
                cmd = self.rx.recv() => cmd,
                _ = tokio::time::sleep(RETRY_INTERVAL), if retry => {
                    self.write_pending().await;
                    continue;
                }
            };
            match cmd {
                Some(PersistCommand::Append(ops)) => {
                    self.pending.extend(ops);
                    self.write_pending().await;
                    if self.records >= self.config.compact_after_records {
                        self.save_snapshot().await;
                    }
                }
                Some(PersistCommand::Session(record)) => self.write_session(record).await,
                Some(PersistCommand::Flush(done)) => {
                    self.write_pending().await;
                    let _ = done.send(());
                }
                Some(PersistCommand::Close) | None => {
                    self.write_pending().await;
                    self.save_snapshot().await;
                    break;
                }
            }
        }
        log::debug!("Persistence worker stopped for {}", self.canvas);
    }

    async fn write_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let store = self.store.clone();
        let canvas = self.canvas.clone();
        let batch = self.pending.clone();
        let result = blocking(move || store.append(&canvas, &batch)).await;
        match result {
            Ok(_) => {
                self.records += 1;
                self.pending.clear();
                self.set_degraded(false);
            }
            Err(e) => {
                log::error!(
                    "Append of {} ops for {} failed: {e}",
                    self.pending.len(),
                    self.canvas
                );
                self.set_degraded(true);
            }
        }
    }

    /// Fold the whole replica into a snapshot and truncate the log. Also
    /// covers anything still pending, since the replica already holds it.
    async fn save_snapshot(&mut self) {
        let snapshot = crate::lock(&self.replica).snapshot();
        let store = self.store.clone();
        let canvas = self.canvas.clone();
        match blocking(move || store.save_snapshot(&canvas, &snapshot)).await {
            Ok(meta) => {
                log::debug!(
                    "Snapshot of {} saved ({} -> {} bytes)",
                    self.canvas,
                    meta.snapshot_size,
                    meta.compressed_size
                );
                self.records = 0;
                self.pending.clear();
                self.set_degraded(false);
            }
            Err(e) => {
                log::error!("Snapshot of {} failed: {e}", self.canvas);
                self.set_degraded(true);
            }
        }
    }

    async fn write_session(&mut self, record: SessionRecord) {
        let store = self.store.clone();
        if let Err(e) = blocking(move || store.save_session(&record)).await {
            log::warn!("Session record for {} not saved: {e}", self.canvas);
        }
    }

    fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::Relaxed);
        if degraded && !was {
            log::warn!("Persistence for {} degraded; running in memory", self.canvas);
        } else if !degraded && was {
            log::info!("Persistence for {} recovered", self.canvas);
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::DatabaseError(format!("store task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use canvas_core::{Intent, ROOT};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<CanvasStore>, CanvasId) {
        let dir = TempDir::new().unwrap();
        let store = CanvasStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, Arc::new(store), CanvasId::parse("persist").unwrap())
    }

    #[tokio::test]
    async fn test_append_and_flush() {
        let (_dir, store, canvas) = setup();
        let replica = Arc::new(Mutex::new(Replica::new(ReplicaId::random())));
        let (handle, task) = PersistWorker::spawn(
            store.clone(),
            canvas.clone(),
            replica.clone(),
            PersistConfig::default(),
            0,
        );

        let op = crate::lock(&replica)
            .local_mutate(Intent::insert(ROOT, None, "rect"))
            .unwrap();
        handle.append(vec![op.clone()]);
        handle.flush().await;

        let loaded = store.load(&canvas).unwrap().unwrap();
        assert_eq!(loaded.operations, vec![op]);
        assert!(!handle.is_degraded());

        handle.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_compacts_after_threshold() {
        let (_dir, store, canvas) = setup();
        let replica = Arc::new(Mutex::new(Replica::new(ReplicaId::random())));
        let config = PersistConfig {
            compact_after_records: 3,
        };
        let (handle, task) =
            PersistWorker::spawn(store.clone(), canvas.clone(), replica.clone(), config, 0);

        for i in 0..3 {
            let op = crate::lock(&replica)
                .local_mutate(Intent::insert(ROOT, None, format!("n{i}")))
                .unwrap();
            handle.append(vec![op]);
        }
        handle.flush().await;

        let meta = store.metadata(&canvas).unwrap().unwrap();
        assert_eq!(meta.pending_records(), 0);
        let loaded = store.load(&canvas).unwrap().unwrap();
        assert_eq!(loaded.snapshot.operations.len(), 3);
        assert!(loaded.operations.is_empty());

        handle.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_saves_snapshot_and_session() {
        let (_dir, store, canvas) = setup();
        let id = ReplicaId::random();
        let replica = Arc::new(Mutex::new(Replica::new(id)));
        let (handle, task) = PersistWorker::spawn(
            store.clone(),
            canvas.clone(),
            replica.clone(),
            PersistConfig::default(),
            0,
        );

        let op = crate::lock(&replica)
            .local_mutate(Intent::insert(ROOT, None, "rect"))
            .unwrap();
        handle.append(vec![op.clone()]);
        let sv = crate::lock(&replica).state_vector().clone();
        handle.record_session(SessionRecord::new(
            canvas.clone(),
            id,
            ConnectionState::Synced,
            sv.clone(),
        ));
        handle.close();
        task.await.unwrap();

        let loaded = store.load(&canvas).unwrap().unwrap();
        assert_eq!(loaded.snapshot.state_vector, sv);
        assert!(loaded.operations.is_empty());
        assert_eq!(loaded.session, store.load_session(&canvas).unwrap());
        let session = loaded.session.unwrap();
        assert_eq!(session.replica_id, id);
        assert_eq!(session.state, ConnectionState::Synced);
        assert_eq!(session.last_synced, sv);

        // Worker is gone; further commands are dropped quietly
        handle.append(vec![op]);
        handle.flush().await;
    }

    #[tokio::test]
    async fn test_disabled_handle_is_inert() {
        let handle = PersistHandle::disabled();
        assert!(handle.is_degraded());
        handle.flush().await;
        handle.close();
    }
}
