//! Sync session: one replica kept in step with the authority.
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!                  ▼                                              │
//! Disconnected ─► Connecting ─► Handshaking ─► Syncing ─► Synced  │
//!                  │ fail          │ timeout                  │ lost
//!                  └──────────► Reconnecting ◄────────────────┘
//!                                  │ backoff elapsed
//!                                  └─► Connecting
//!
//! teardown (any state) ─► final flush if Synced ─► Disconnected
//! ```
//!
//! The consumer side (`local_mutate`, `query`, `subscribe`) only touches the
//! in-memory replica and returns immediately. Network traffic runs on a
//! background driver task; disk writes on the persistence worker.
//!
//! Handshake:
//! ```text
//! session                          authority
//!    │── Hello ───────────────────────►│
//!    │── SyncStep1(local sv) ─────────►│
//!    │◄──────────── SyncStep1(its sv) ─│
//!    │── SyncStep2(ops it lacks) ─────►│
//!    │◄────────── SyncStep2(ops we lack)│   (or Resync ─► ResyncRequest)
//!    │── Ack(local sv) ───────────────►│
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canvas_core::{
    CanvasId, ChangeBatch, ChangeOrigin, Credential, Intent, NodeId, NodeView, Operation,
    Replica, ReplicaId, ReplicaSnapshot, StateVector,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::{CollabConfig, SyncConfig};
use crate::error::SyncError;
use crate::persist::{PersistHandle, PersistWorker, SessionRecord};
use crate::presence::PresenceMap;
use crate::protocol::{AwarenessState, MessageType, SyncMessage};
use crate::storage::CanvasStore;
use crate::transport::{Connector, Transport};

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Syncing,
    Synced,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_synced(&self) -> bool {
        matches!(self, ConnectionState::Synced)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Synced => "synced",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Store access for a session restored from the local cache.
pub struct SessionStore {
    pub store: Arc<CanvasStore>,
    /// Log records left over since the last snapshot
    pub pending_records: u64,
    /// Frontier the authority last acknowledged, if recorded
    pub last_synced: StateVector,
}

enum Command {
    Push,
    Awareness(AwarenessState),
    ForceSync(oneshot::Sender<Result<(), SyncError>>),
}

/// A running sync session. Owned by the session manager.
pub struct SyncSession {
    canvas: CanvasId,
    replica_id: ReplicaId,
    replica: Arc<Mutex<Replica>>,
    changes: broadcast::Sender<ChangeBatch>,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    persist: PersistHandle,
    persist_task: Mutex<Option<JoinHandle<()>>>,
    presence: Arc<Mutex<PresenceMap>>,
}

impl SyncSession {
    /// Start syncing `replica` for `canvas`. Must be called inside a tokio
    /// runtime.
    pub fn start(
        canvas: CanvasId,
        credential: Credential,
        replica: Replica,
        connector: Arc<dyn Connector>,
        store: Option<SessionStore>,
        config: &CollabConfig,
    ) -> Self {
        let replica_id = replica.id();
        let replica = Arc::new(Mutex::new(replica));
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let presence = Arc::new(Mutex::new(PresenceMap::new(replica_id)));

        let (persist, persist_task, acked) = match store {
            Some(session_store) => {
                let (handle, task) = PersistWorker::spawn(
                    session_store.store,
                    canvas.clone(),
                    replica.clone(),
                    config.persist.clone(),
                    session_store.pending_records,
                );
                (handle, Some(task), session_store.last_synced)
            }
            None => (PersistHandle::disabled(), None, StateVector::new()),
        };

        let driver = Driver {
            canvas: canvas.clone(),
            replica_id,
            credential,
            replica: replica.clone(),
            changes: changes.clone(),
            state: state_tx,
            commands: command_rx,
            cancel: cancel.clone(),
            connector,
            backoff: Backoff::new(config.sync.backoff.clone()),
            config: config.sync.clone(),
            persist: persist.clone(),
            presence: presence.clone(),
            awareness: None,
            acked,
            waiters: Vec::new(),
        };
        let driver = tokio::spawn(driver.run());
        log::info!("Session for {canvas} started as {replica_id}");

        Self {
            canvas,
            replica_id,
            replica,
            changes,
            state,
            commands,
            cancel,
            driver: Mutex::new(Some(driver)),
            persist,
            persist_task: Mutex::new(persist_task),
            presence,
        }
    }

    pub fn canvas_id(&self) -> &CanvasId {
        &self.canvas
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Apply a consumer intent locally, queue it for the authority and the
    /// store. Never waits on network or disk.
    pub fn local_mutate(&self, intent: Intent) -> Result<Operation, SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::SessionClosed);
        }
        let op = {
            let mut replica = crate::lock(&self.replica);
            let op = replica.local_mutate(intent)?;
            // Sent under the lock so batches reach subscribers in version order
            if let Some(batch) = replica.take_changes(ChangeOrigin::Local) {
                let _ = self.changes.send(batch);
            }
            op
        };
        self.persist.append(vec![op.clone()]);
        let _ = self.commands.send(Command::Push);
        Ok(op)
    }

    pub fn query(&self, node: NodeId) -> Option<NodeView> {
        crate::lock(&self.replica).query(node)
    }

    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        crate::lock(&self.replica).children(parent)
    }

    pub fn visible_nodes(&self) -> Vec<NodeView> {
        crate::lock(&self.replica).document().visible_nodes()
    }

    pub fn state_vector(&self) -> StateVector {
        crate::lock(&self.replica).state_vector().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.changes.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Publish local presence. Re-sent after every reconnect.
    pub fn set_awareness(&self, state: AwarenessState) {
        let _ = self.commands.send(Command::Awareness(state));
    }

    pub fn presence(&self) -> HashMap<ReplicaId, AwarenessState> {
        crate::lock(&self.presence).snapshot()
    }

    /// Push pending operations and wait until the authority acknowledges
    /// everything held locally.
    pub async fn force_sync(&self, timeout: Duration) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ForceSync(tx))
            .map_err(|_| SyncError::SessionClosed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::SessionClosed),
            Err(_) => Err(SyncError::Timeout("authority acknowledgement")),
        }
    }

    /// Wait until queued store writes have been attempted.
    pub async fn flush_persistence(&self) {
        self.persist.flush().await;
    }

    pub fn is_persistence_degraded(&self) -> bool {
        self.persist.is_degraded()
    }

    /// Final flush, close the transport, stop persistence. Waits for both
    /// background tasks; later calls return immediately.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let driver = crate::lock(&self.driver).take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                log::error!("Sync driver for {} failed: {e}", self.canvas);
            }
        }
        self.persist.close();
        let task = crate::lock(&self.persist_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Persistence worker for {} failed: {e}", self.canvas);
            }
        }
        log::info!("Session for {} shut down", self.canvas);
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        // Dropped without shutdown: let the driver wind down on its own.
        self.cancel.cancel();
    }
}

// ─── Driver ───────────────────────────────────────────────────────────

/// One live transport plus what we know the authority holds through it.
struct Link {
    transport: Box<dyn Transport>,
    /// Authority frontier as far as this connection has shown
    remote_known: StateVector,
    /// Frontier announced ahead of a resync snapshot
    resync: Option<StateVector>,
    synced: bool,
    awaiting_pong: bool,
}

struct Driver {
    canvas: CanvasId,
    replica_id: ReplicaId,
    credential: Credential,
    replica: Arc<Mutex<Replica>>,
    changes: broadcast::Sender<ChangeBatch>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    config: SyncConfig,
    persist: PersistHandle,
    presence: Arc<Mutex<PresenceMap>>,
    /// Latest local presence
    awareness: Option<AwarenessState>,
    /// Highest frontier the authority has acknowledged
    acked: StateVector,
    waiters: Vec<(StateVector, oneshot::Sender<Result<(), SyncError>>)>,
}

impl Driver {
    async fn run(mut self) {
        while !self.cancel.is_cancelled() {
            self.set_state(ConnectionState::Connecting);
            match self.connect().await {
                Ok(transport) => match self.drive(transport).await {
                    Ok(()) => break,
                    Err(e) => log::warn!("Link to authority for {} lost: {e}", self.canvas),
                },
                Err(SyncError::SessionClosed) => break,
                Err(e) => log::warn!("Connect for {} failed: {e}", self.canvas),
            }
            crate::lock(&self.presence).clear();
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.next_delay();
            log::debug!(
                "Reconnecting {} in {delay:?} (attempt {})",
                self.canvas,
                self.backoff.attempt()
            );
            if !self.idle(delay).await {
                break;
            }
        }

        crate::lock(&self.presence).clear();
        for (_, waiter) in self.waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::SessionClosed));
        }
        self.record_session(ConnectionState::Disconnected);
        self.set_state(ConnectionState::Disconnected);
        log::debug!("Sync driver for {} stopped", self.canvas);
    }

    async fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::SessionClosed),
            result = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(&self.canvas),
            ) => result.map_err(|_| SyncError::Timeout("connect"))?,
        }
    }

    /// Sleep out a backoff delay while serving commands. Returns false
    /// once the session is torn down.
    async fn idle(&mut self, delay: Duration) -> bool {
        let wake = tokio::time::sleep(delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut wake => return true,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Push) => {}
                    Some(Command::Awareness(state)) => self.awareness = Some(state),
                    Some(Command::ForceSync(tx)) => self.add_waiter(tx),
                    None => return false,
                },
            }
        }
    }

    /// Run one connection. `Ok` means the session was torn down, `Err`
    /// that the link was lost.
    async fn drive(&mut self, transport: Box<dyn Transport>) -> Result<(), SyncError> {
        let mut link = Link {
            transport,
            remote_known: StateVector::new(),
            resync: None,
            synced: false,
            awaiting_pong: false,
        };
        let result = self.exchange(&mut link).await;
        link.transport.close().await;
        result
    }

    async fn exchange(&mut self, link: &mut Link) -> Result<(), SyncError> {
        self.set_state(ConnectionState::Handshaking);
        let local = crate::lock(&self.replica).state_vector().clone();
        link.transport
            .send(&SyncMessage::hello(
                self.replica_id,
                self.canvas.clone(),
                &self.credential,
            )?)
            .await?;
        link.transport
            .send(&SyncMessage::sync_step1(
                self.replica_id,
                self.canvas.clone(),
                &local,
            )?)
            .await?;

        let deadline = Instant::now() + self.config.handshake_timeout;
        let beat = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + beat, beat);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown(link).await;
                    return Ok(());
                }
                incoming = link.transport.recv() => match incoming {
                    Ok(Some(msg)) => self.on_message(link, msg).await?,
                    Ok(None) => return Err(SyncError::Transport("closed by authority".into())),
                    Err(e) => return Err(e.into()),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(link, cmd).await?,
                    None => {
                        self.teardown(link).await;
                        return Ok(());
                    }
                },
                _ = heartbeat.tick() => {
                    if link.awaiting_pong {
                        return Err(SyncError::Timeout("heartbeat"));
                    }
                    link.awaiting_pong = true;
                    link.transport
                        .send(&SyncMessage::ping(self.replica_id, self.canvas.clone()))
                        .await?;
                    let idle = crate::lock(&self.presence).cleanup_idle(beat * 4);
                    if idle > 0 {
                        log::debug!("Dropped {idle} idle peers from {}", self.canvas);
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !link.synced => {
                    return Err(SyncError::Timeout("handshake"));
                }
            }
        }
    }

    async fn on_message(&mut self, link: &mut Link, msg: SyncMessage) -> Result<(), SyncError> {
        link.awaiting_pong = false;
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let remote = msg.state_vector()?;
                log::debug!(
                    "Authority frontier for {} spans {} replicas",
                    self.canvas,
                    remote.len()
                );
                link.remote_known.merge(&remote);
                self.acknowledged(&remote);
                if link.resync.is_some() {
                    link.resync = Some(remote);
                }
                self.set_state(ConnectionState::Syncing);
                self.push(link, MessageType::SyncStep2).await?;
            }
            MessageType::SyncStep2 => {
                let ops = msg.operations()?;
                let ids: Vec<_> = ops.iter().map(|op| op.id).collect();
                match link.resync.take() {
                    Some(frontier) => {
                        log::info!(
                            "Full resync of {}: {} ops from snapshot",
                            self.canvas,
                            ops.len()
                        );
                        self.apply_remote(ops, Some(frontier.clone()));
                        link.remote_known.merge(&frontier);
                    }
                    None => {
                        log::debug!("Received {} ops for {}", ops.len(), self.canvas);
                        self.apply_remote(ops, None);
                    }
                }
                for id in ids {
                    link.remote_known.observe(id);
                }
                if !link.synced {
                    link.synced = true;
                    self.backoff.reset();
                    self.set_state(ConnectionState::Synced);
                    log::info!("Session for {} synced", self.canvas);
                    if let Some(state) = &self.awareness {
                        link.transport
                            .send(&SyncMessage::awareness(
                                self.replica_id,
                                self.canvas.clone(),
                                state,
                            )?)
                            .await?;
                    }
                }
                self.push(link, MessageType::Update).await?;
                self.send_ack(link).await?;
            }
            MessageType::Update => {
                let ops = msg.operations()?;
                log::debug!(
                    "Update of {} ops from {} on {}",
                    ops.len(),
                    msg.replica_id,
                    self.canvas
                );
                let ids: Vec<_> = ops.iter().map(|op| op.id).collect();
                self.apply_remote(ops, None);
                for id in ids {
                    link.remote_known.observe(id);
                }
                self.send_ack(link).await?;
            }
            MessageType::Ack => {
                let frontier = msg.state_vector()?;
                link.remote_known.merge(&frontier);
                self.acknowledged(&frontier);
                self.record_session(ConnectionState::Synced);
            }
            MessageType::Resync => {
                log::warn!(
                    "{}; requesting full resync of {}",
                    SyncError::ProtocolMismatch("authority cannot serve our state vector".into()),
                    self.canvas
                );
                link.resync = Some(StateVector::new());
                link.transport
                    .send(&SyncMessage::resync_request(
                        self.replica_id,
                        self.canvas.clone(),
                    ))
                    .await?;
            }
            MessageType::Awareness => {
                let state = msg.awareness_state()?;
                log::trace!("Awareness from {} on {}", msg.replica_id, self.canvas);
                crate::lock(&self.presence).apply(msg.replica_id, state);
            }
            MessageType::PeerLeft => {
                crate::lock(&self.presence).remove(&msg.replica_id);
            }
            MessageType::Ping => {
                link.transport
                    .send(&SyncMessage::pong(self.replica_id, self.canvas.clone()))
                    .await?;
            }
            MessageType::Pong => {}
            other => log::debug!("Ignoring {other:?} on {}", self.canvas),
        }
        Ok(())
    }

    async fn on_command(&mut self, link: &mut Link, cmd: Command) -> Result<(), SyncError> {
        match cmd {
            Command::Push => {
                if link.synced {
                    self.push(link, MessageType::Update).await?;
                }
            }
            Command::Awareness(state) => {
                if link.synced {
                    link.transport
                        .send(&SyncMessage::awareness(
                            self.replica_id,
                            self.canvas.clone(),
                            &state,
                        )?)
                        .await?;
                }
                self.awareness = Some(state);
            }
            Command::ForceSync(tx) => {
                self.add_waiter(tx);
                if link.synced {
                    self.push(link, MessageType::Update).await?;
                }
            }
        }
        Ok(())
    }

    /// Send every logged operation the authority is not known to hold.
    async fn push(&mut self, link: &mut Link, msg_type: MessageType) -> Result<(), SyncError> {
        let ops = {
            let replica = crate::lock(&self.replica);
            match replica.operations_since(&link.remote_known) {
                Ok(ops) => ops,
                // Our own log was restored from a compacted snapshot
                Err(_) => replica
                    .snapshot()
                    .operations
                    .into_iter()
                    .filter(|op| !link.remote_known.contains(&op.id))
                    .collect(),
            }
        };
        if ops.is_empty() {
            return Ok(());
        }
        let msg = match msg_type {
            MessageType::SyncStep2 => {
                SyncMessage::sync_step2(self.replica_id, self.canvas.clone(), &ops)?
            }
            _ => SyncMessage::update(self.replica_id, self.canvas.clone(), &ops)?,
        };
        link.transport.send(&msg).await?;
        for op in &ops {
            link.remote_known.observe(op.id);
        }
        log::debug!("Pushed {} ops for {}", ops.len(), self.canvas);
        Ok(())
    }

    async fn send_ack(&mut self, link: &mut Link) -> Result<(), SyncError> {
        let local = crate::lock(&self.replica).state_vector().clone();
        link.transport
            .send(&SyncMessage::ack(self.replica_id, self.canvas.clone(), &local)?)
            .await?;
        Ok(())
    }

    /// Integrate remote ops, notify subscribers and queue fresh ones for
    /// the store. `cover` is the frontier of a resync snapshot.
    fn apply_remote(&mut self, ops: Vec<Operation>, cover: Option<StateVector>) {
        let fresh = {
            let mut replica = crate::lock(&self.replica);
            let mut fresh: Vec<Operation> = ops
                .iter()
                .filter(|op| !replica.log().contains(&op.id))
                .cloned()
                .collect();
            let report = match cover {
                Some(state_vector) => replica.integrate_snapshot(ReplicaSnapshot {
                    state_vector,
                    operations: ops,
                }),
                None => replica.integrate(ops),
            };
            if report.rejected > 0 {
                log::warn!(
                    "Rejected {} malformed ops on {}",
                    report.rejected,
                    self.canvas
                );
            }
            if report.deferred > 0 {
                log::debug!(
                    "{} ops on {} wait for dependencies",
                    report.deferred,
                    self.canvas
                );
            }
            if let Some(batch) = replica.take_changes(ChangeOrigin::Remote) {
                let _ = self.changes.send(batch);
            }
            fresh.retain(|op| replica.log().contains(&op.id));
            fresh
        };
        self.persist.append(fresh);
    }

    fn acknowledged(&mut self, frontier: &StateVector) {
        self.acked.merge(frontier);
        crate::lock(&self.replica)
            .log_mut()
            .merge_remote_state_vector(frontier);
        self.resolve_waiters();
    }

    fn add_waiter(&mut self, tx: oneshot::Sender<Result<(), SyncError>>) {
        let target = crate::lock(&self.replica).state_vector().clone();
        self.waiters.push((target, tx));
        self.resolve_waiters();
    }

    fn resolve_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let acked = self.acked.clone();
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(target, _)| acked.dominates(target));
        self.waiters = waiting;
        for (_, tx) in done {
            let _ = tx.send(Ok(()));
        }
    }

    /// Bounded final push on explicit close. Failure is logged only; the
    /// operations are already in the store.
    async fn teardown(&mut self, link: &mut Link) {
        if !link.synced {
            return;
        }
        let timeout = self.config.final_flush_timeout;
        match tokio::time::timeout(timeout, self.final_flush(link)).await {
            Ok(Ok(())) => log::debug!("Final flush of {} acknowledged", self.canvas),
            Ok(Err(e)) => log::warn!("Final flush of {} failed: {e}", self.canvas),
            Err(_) => log::warn!("Final flush of {} timed out after {timeout:?}", self.canvas),
        }
    }

    async fn final_flush(&mut self, link: &mut Link) -> Result<(), SyncError> {
        let target = crate::lock(&self.replica).state_vector().clone();
        if self.acked.dominates(&target) {
            return Ok(());
        }
        self.push(link, MessageType::Update).await?;
        while !self.acked.dominates(&target) {
            match link.transport.recv().await? {
                Some(msg) => self.on_message(link, msg).await?,
                None => return Err(SyncError::Transport("closed during final flush".into())),
            }
        }
        Ok(())
    }

    fn record_session(&self, state: ConnectionState) {
        self.persist.record_session(SessionRecord::new(
            self.canvas.clone(),
            self.replica_id,
            state,
            self.acked.clone(),
        ));
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::debug!("Session for {} is {next}", self.canvas);
        }
    }
}
