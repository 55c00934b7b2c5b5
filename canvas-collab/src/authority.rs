//! Reference sync authority with room-based canvas routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!              ├── Room (canvas_id) ── Replica ── BroadcastGroup
//! Session B ──┘                          │
//!                                        └── CanvasStore (optional)
//! ```
//!
//! Per-peer protocol:
//! ```text
//! Hello ──► attach to room
//! SyncStep1(sv) ──► SyncStep1(room sv) + SyncStep2(delta), subscribe
//!               └─► SyncStep1(room sv) + Resync      (sv below truncation floor)
//! ResyncRequest ──► SyncStep1(room sv) + SyncStep2(compacted ops), subscribe
//! SyncStep2 / Update ──► integrate, relay Update to others, Ack(room sv)
//! Ack ──► record peer frontier
//! Awareness ──► relay to others
//! disconnect ──► PeerLeft to others; last peer out closes the room
//! ```
//!
//! A peer is subscribed to the room broadcast in the same critical section
//! that computes its delta, so it never misses or double-receives an
//! update. A peer whose receiver lags is disconnected and re-handshakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canvas_core::{
    CanvasId, ChangeOrigin, NodeView, Operation, Replica, ReplicaId, StateVector,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::broadcast::{BroadcastGroup, BroadcastStats};
use crate::config::AuthorityConfig;
use crate::error::SyncError;
use crate::protocol::{MessageType, SyncMessage, PROTOCOL_VERSION};
use crate::storage::{CanvasStore, StoreError};
use crate::transport::{Transport, WsTransport};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

struct Room {
    canvas: CanvasId,
    state: Mutex<RoomState>,
}

struct RoomState {
    replica: Replica,
    group: BroadcastGroup,
    /// Peer tasks holding this room, subscribed or not
    attached: usize,
}

struct AuthorityInner {
    config: AuthorityConfig,
    store: Option<Arc<CanvasStore>>,
    rooms: tokio::sync::Mutex<HashMap<CanvasId, Arc<Room>>>,
    resyncs: AtomicU64,
}

/// In-repo sync authority. Cheap to clone.
#[derive(Clone)]
pub struct Authority {
    inner: Arc<AuthorityInner>,
}

type Relay = Option<broadcast::Receiver<Arc<SyncMessage>>>;

impl Authority {
    /// Create an authority, opening its store if one is configured.
    pub fn new(config: AuthorityConfig) -> Result<Self, SyncError> {
        let store = match &config.store {
            Some(store_config) => Some(Arc::new(CanvasStore::open(store_config.clone())?)),
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Create an authority around an already opened store.
    pub fn with_store(config: AuthorityConfig, store: Option<Arc<CanvasStore>>) -> Self {
        Self {
            inner: Arc::new(AuthorityInner {
                config,
                store,
                rooms: tokio::sync::Mutex::new(HashMap::new()),
                resyncs: AtomicU64::new(0),
            }),
        }
    }

    /// In-memory authority with default settings.
    pub fn in_memory() -> Self {
        Self::with_store(AuthorityConfig::default(), None)
    }

    /// Bind the configured address and serve WebSocket peers forever.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr)
            .await
            .map_err(|e| SyncError::Transport(format!("bind {}: {e}", self.inner.config.bind_addr)))?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept WebSocket peers on `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Sync authority listening on {addr}");
        }
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            let authority = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        log::debug!("WebSocket connection from {addr}");
                        authority.handle_peer(Box::new(WsTransport::new(ws))).await;
                    }
                    Err(e) => log::warn!("WebSocket handshake with {addr} failed: {e}"),
                }
            });
        }
    }

    /// Drive one peer connection until it closes.
    pub async fn handle_peer(&self, mut transport: Box<dyn Transport>) {
        let hello = match tokio::time::timeout(HELLO_TIMEOUT, transport.recv()).await {
            Ok(Ok(Some(msg))) if msg.msg_type == MessageType::Hello => msg,
            Ok(Ok(Some(msg))) => {
                log::warn!("Expected Hello, got {:?}", msg.msg_type);
                transport.close().await;
                return;
            }
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                log::debug!("Peer dropped before Hello: {e}");
                return;
            }
            Err(_) => {
                log::debug!("Peer sent no Hello within {HELLO_TIMEOUT:?}");
                transport.close().await;
                return;
            }
        };
        match hello.hello_payload() {
            Ok(h) if h.protocol_version == PROTOCOL_VERSION => {}
            Ok(h) => {
                log::warn!(
                    "Peer {} speaks protocol {} (expected {PROTOCOL_VERSION})",
                    hello.replica_id,
                    h.protocol_version
                );
                transport.close().await;
                return;
            }
            Err(e) => {
                log::warn!("Malformed Hello from {}: {e}", hello.replica_id);
                transport.close().await;
                return;
            }
        }

        let canvas = hello.canvas_id;
        let peer = hello.replica_id;
        let room = match self.attach(&canvas).await {
            Ok(room) => room,
            Err(e) => {
                log::error!("Cannot open room {canvas}: {e}");
                transport.close().await;
                return;
            }
        };
        log::info!("Peer {peer} joined {canvas}");

        if let Err(e) = self.peer_loop(&room, peer, transport.as_mut()).await {
            log::debug!("Peer {peer} on {canvas} dropped: {e}");
        }

        transport.close().await;
        self.detach(&room, peer).await;
        log::info!("Peer {peer} left {canvas}");
    }

    async fn peer_loop(
        &self,
        room: &Room,
        peer: ReplicaId,
        transport: &mut dyn Transport,
    ) -> Result<(), SyncError> {
        let mut relay: Relay = None;
        loop {
            tokio::select! {
                incoming = transport.recv() => match incoming {
                    Ok(Some(msg)) => self.on_message(room, peer, &mut relay, transport, msg).await?,
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(e.into()),
                },
                relayed = next_relay(&mut relay) => match relayed {
                    Ok(msg) => {
                        if msg.replica_id != peer {
                            transport.send(&msg).await?;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        crate::lock(&room.state).group.record_dropped(n);
                        log::warn!("Peer {peer} lagged by {n} messages; disconnecting");
                        return Ok(());
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn on_message(
        &self,
        room: &Room,
        peer: ReplicaId,
        relay: &mut Relay,
        transport: &mut dyn Transport,
        msg: SyncMessage,
    ) -> Result<(), SyncError> {
        let canvas = room.canvas.clone();
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let remote = msg.state_vector()?;
                let (me, own, delta) = {
                    let mut state = crate::lock(&room.state);
                    let me = state.replica.id();
                    let own = state.replica.state_vector().clone();
                    let delta = match state.replica.operations_since(&remote) {
                        Ok(delta) => {
                            *relay = Some(state.group.add_peer(peer, remote.clone()));
                            Some(delta)
                        }
                        Err(e) => {
                            log::info!("Peer {peer} needs full resync of {canvas}: {e}");
                            None
                        }
                    };
                    (me, own, delta)
                };
                transport
                    .send(&SyncMessage::sync_step1(me, canvas.clone(), &own)?)
                    .await?;
                match delta {
                    Some(ops) => {
                        log::debug!("Sending {} ops to {peer}", ops.len());
                        transport
                            .send(&SyncMessage::sync_step2(me, canvas, &ops)?)
                            .await?;
                    }
                    None => transport.send(&SyncMessage::resync(me, canvas)).await?,
                }
            }
            MessageType::ResyncRequest => {
                let (me, snapshot) = {
                    let mut state = crate::lock(&room.state);
                    let snapshot = state.replica.snapshot();
                    *relay = Some(state.group.add_peer(peer, StateVector::new()));
                    (state.replica.id(), snapshot)
                };
                self.inner.resyncs.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Full resync of {canvas} for {peer}: {} ops",
                    snapshot.operations.len()
                );
                transport
                    .send(&SyncMessage::sync_step1(me, canvas.clone(), &snapshot.state_vector)?)
                    .await?;
                transport
                    .send(&SyncMessage::sync_step2(me, canvas, &snapshot.operations)?)
                    .await?;
            }
            MessageType::SyncStep2 | MessageType::Update => {
                let ops = msg.operations()?;
                let pushed: StateVector = ops
                    .iter()
                    .filter(|op| op.id.replica == peer)
                    .map(|op| (op.id.replica, op.id.counter))
                    .collect();
                let (me, fresh, own) = {
                    let mut state = crate::lock(&room.state);
                    let fresh = integrate_fresh(&mut state.replica, ops);
                    if !fresh.is_empty() {
                        state
                            .group
                            .broadcast(SyncMessage::update(peer, canvas.clone(), &fresh)?);
                    }
                    state.group.acknowledge(&peer, &pushed);
                    (
                        state.replica.id(),
                        fresh,
                        state.replica.state_vector().clone(),
                    )
                };
                if !fresh.is_empty() {
                    log::debug!("Integrated {} ops from {peer} into {canvas}", fresh.len());
                    self.persist(&canvas, fresh).await;
                }
                transport.send(&SyncMessage::ack(me, canvas, &own)?).await?;
            }
            MessageType::Ack => {
                let frontier = msg.state_vector()?;
                crate::lock(&room.state).group.acknowledge(&peer, &frontier);
            }
            MessageType::Awareness => {
                log::trace!("Awareness from {peer} on {canvas}");
                crate::lock(&room.state).group.broadcast(msg);
            }
            MessageType::Ping => {
                transport.send(&SyncMessage::pong(peer, canvas)).await?;
            }
            MessageType::Pong => {}
            other => log::warn!("Ignoring unexpected {other:?} from {peer}"),
        }
        Ok(())
    }

    async fn persist(&self, canvas: &CanvasId, ops: Vec<Operation>) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        let canvas = canvas.clone();
        let result = tokio::task::spawn_blocking(move || store.append(&canvas, &ops)).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::error!("Authority append failed: {e}"),
            Err(e) => log::error!("Authority append task failed: {e}"),
        }
    }

    async fn attach(&self, canvas: &CanvasId) -> Result<Arc<Room>, SyncError> {
        let mut rooms = self.inner.rooms.lock().await;
        if let Some(room) = rooms.get(canvas) {
            crate::lock(&room.state).attached += 1;
            return Ok(room.clone());
        }

        let replica = self.restore(canvas).await?;
        log::info!(
            "Opened room {canvas} as {} ({} ops)",
            replica.id(),
            replica.log().len()
        );
        let room = Arc::new(Room {
            canvas: canvas.clone(),
            state: Mutex::new(RoomState {
                replica,
                group: BroadcastGroup::new(self.inner.config.broadcast_capacity),
                attached: 1,
            }),
        });
        rooms.insert(canvas.clone(), room.clone());
        Ok(room)
    }

    async fn restore(&self, canvas: &CanvasId) -> Result<Replica, SyncError> {
        let id = ReplicaId::random();
        let Some(store) = self.inner.store.clone() else {
            return Ok(Replica::new(id));
        };
        let key = canvas.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&key))
            .await
            .map_err(|e| SyncError::PersistenceUnavailable(StoreError::DatabaseError(e.to_string())))??;
        let Some(loaded) = loaded else {
            return Ok(Replica::new(id));
        };
        let mut replica = Replica::from_snapshot(id, loaded.snapshot);
        replica.integrate(loaded.operations);
        replica.take_changes(ChangeOrigin::Restore);
        Ok(replica)
    }

    async fn detach(&self, room: &Room, peer: ReplicaId) {
        let canvas = room.canvas.clone();
        // Held across the snapshot save so a reopening room sees it.
        let mut rooms = self.inner.rooms.lock().await;
        let closing = {
            let mut state = crate::lock(&room.state);
            state.group.remove_peer(&peer);
            state.attached = state.attached.saturating_sub(1);
            if state.attached > 0 {
                state
                    .group
                    .broadcast(SyncMessage::peer_left(peer, canvas.clone()));
                None
            } else {
                Some(state.replica.snapshot())
            }
        };
        let Some(snapshot) = closing else {
            return;
        };
        rooms.remove(&canvas);

        if let Some(store) = self.inner.store.clone() {
            let key = canvas.clone();
            match tokio::task::spawn_blocking(move || store.save_snapshot(&key, &snapshot)).await {
                Ok(Ok(meta)) => log::debug!(
                    "Saved {canvas} snapshot ({} bytes compressed)",
                    meta.compressed_size
                ),
                Ok(Err(e)) => log::error!("Snapshot of {canvas} failed: {e}"),
                Err(e) => log::error!("Snapshot task for {canvas} failed: {e}"),
            }
        }
        log::info!("Closed room {canvas}");
    }

    async fn room(&self, canvas: &CanvasId) -> Option<Arc<Room>> {
        self.inner.rooms.lock().await.get(canvas).cloned()
    }

    /// Truncate the room log to what every connected peer holds and
    /// garbage-collect tombstones. Returns `(truncated ops, collected nodes)`.
    pub async fn compact(&self, canvas: &CanvasId) -> Option<(usize, usize)> {
        let room = self.room(canvas).await?;
        let mut state = crate::lock(&room.state);
        let frontier = StateVector::minimum(
            state
                .group
                .frontiers()
                .chain(std::iter::once(state.replica.state_vector())),
        );
        let (truncated, collected) = state.replica.compact(&frontier);
        log::info!("Compacted {canvas}: {truncated} ops truncated, {collected} nodes collected");
        Some((truncated, collected))
    }

    /// Visible nodes of an open room, depth first from the root.
    pub async fn visible_nodes(&self, canvas: &CanvasId) -> Option<Vec<NodeView>> {
        let room = self.room(canvas).await?;
        let state = crate::lock(&room.state);
        Some(state.replica.document().visible_nodes())
    }

    pub async fn state_vector(&self, canvas: &CanvasId) -> Option<StateVector> {
        let room = self.room(canvas).await?;
        let state = crate::lock(&room.state);
        Some(state.replica.state_vector().clone())
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.lock().await.len()
    }

    /// Subscribed peers of an open room.
    pub async fn peer_count(&self, canvas: &CanvasId) -> usize {
        match self.room(canvas).await {
            Some(room) => crate::lock(&room.state).group.peer_count(),
            None => 0,
        }
    }

    pub async fn stats(&self, canvas: &CanvasId) -> Option<BroadcastStats> {
        let room = self.room(canvas).await?;
        let stats = crate::lock(&room.state).group.stats();
        Some(stats)
    }

    /// Full resyncs served since start.
    pub fn resync_count(&self) -> u64 {
        self.inner.resyncs.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> Option<&Arc<CanvasStore>> {
        self.inner.store.as_ref()
    }
}

async fn next_relay(relay: &mut Relay) -> Result<Arc<SyncMessage>, RecvError> {
    match relay {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Integrate `ops` and return the ones that were new and accepted.
fn integrate_fresh(replica: &mut Replica, ops: Vec<Operation>) -> Vec<Operation> {
    let mut fresh: Vec<Operation> = ops
        .iter()
        .filter(|op| !replica.log().contains(&op.id))
        .cloned()
        .collect();
    let report = replica.integrate(ops);
    if report.rejected > 0 {
        log::warn!("Rejected {} malformed ops", report.rejected);
    }
    // No local subscribers on the authority
    replica.take_changes(ChangeOrigin::Remote);
    fresh.retain(|op| replica.log().contains(&op.id));
    fresh.dedup_by_key(|op| op.id);
    fresh
}
