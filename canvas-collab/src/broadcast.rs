//! Fan-out of relayed messages to every peer of one canvas room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! peer gets an independent receiver buffering up to `capacity` messages;
//! a peer that falls further behind is disconnected and re-handshakes.
//! Receivers skip messages whose `replica_id` is their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use canvas_core::{ReplicaId, StateVector};
use tokio::sync::broadcast;

use crate::protocol::SyncMessage;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// One subscribed peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub replica: ReplicaId,
    /// Best known frontier of the peer (from its handshake and acks)
    pub frontier: StateVector,
    pub joined_at: Instant,
}

/// Broadcast group for a single canvas room.
///
/// Lives inside the room state, so membership changes and sends are
/// ordered with the room's replica updates.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<SyncMessage>>,
    peers: HashMap<ReplicaId, PeerInfo>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: HashMap::new(),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver. Re-adding a peer keeps the
    /// larger frontier.
    pub fn add_peer(
        &mut self,
        replica: ReplicaId,
        frontier: StateVector,
    ) -> broadcast::Receiver<Arc<SyncMessage>> {
        let entry = self.peers.entry(replica).or_insert_with(|| PeerInfo {
            replica,
            frontier: StateVector::new(),
            joined_at: Instant::now(),
        });
        entry.frontier.merge(&frontier);
        self.sender.subscribe()
    }

    pub fn remove_peer(&mut self, replica: &ReplicaId) -> Option<PeerInfo> {
        self.peers.remove(replica)
    }

    /// Merge an acknowledged frontier into a peer's entry.
    pub fn acknowledge(&mut self, replica: &ReplicaId, frontier: &StateVector) -> bool {
        match self.peers.get_mut(replica) {
            Some(peer) => {
                peer.frontier.merge(frontier);
                true
            }
            None => false,
        }
    }

    /// Send to every subscriber. Returns the number of receivers.
    pub fn broadcast(&self, msg: SyncMessage) -> usize {
        let count = self.sender.send(Arc::new(msg)).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a lagging receiver lost `n` messages.
    pub fn record_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn frontiers(&self) -> impl Iterator<Item = &StateVector> {
        self.peers.values().map(|p| &p.frontier)
    }

    pub fn peer(&self, replica: &ReplicaId) -> Option<&PeerInfo> {
        self.peers.get(replica)
    }

    pub fn has_peer(&self, replica: &ReplicaId) -> bool {
        self.peers.contains_key(replica)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }
}
