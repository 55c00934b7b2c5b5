//! Ephemeral presence of remote peers (cursor, selection, editing).
//!
//! ```text
//! Awareness msg ──► PresenceMap::apply ──► peers[replica] = state
//! PeerLeft msg  ──► PresenceMap::remove
//! disconnect    ──► PresenceMap::clear   (no compensation)
//! ```
//!
//! Nothing here is persisted or replicated through the CRDT.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use canvas_core::ReplicaId;

use crate::protocol::AwarenessState;

#[derive(Debug, Clone)]
struct PeerPresence {
    state: AwarenessState,
    last_seen: Instant,
}

/// Last known awareness state per remote replica.
#[derive(Debug)]
pub struct PresenceMap {
    local: ReplicaId,
    peers: HashMap<ReplicaId, PeerPresence>,
}

impl PresenceMap {
    pub fn new(local: ReplicaId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    /// Record a peer's state. Echoes of our own state are ignored.
    pub fn apply(&mut self, replica: ReplicaId, state: AwarenessState) -> bool {
        if replica == self.local {
            return false;
        }
        self.peers.insert(
            replica,
            PeerPresence {
                state,
                last_seen: Instant::now(),
            },
        );
        true
    }

    pub fn remove(&mut self, replica: &ReplicaId) -> bool {
        self.peers.remove(replica).is_some()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn get(&self, replica: &ReplicaId) -> Option<&AwarenessState> {
        self.peers.get(replica).map(|p| &p.state)
    }

    /// Copy of every peer's state.
    pub fn snapshot(&self) -> HashMap<ReplicaId, AwarenessState> {
        self.peers
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop peers not heard from within `idle`. Returns how many were removed.
    pub fn cleanup_idle(&mut self, idle: Duration) -> usize {
        let before = self.peers.len();
        let now = Instant::now();
        self.peers
            .retain(|_, p| now.duration_since(p.last_seen) < idle);
        before - self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str) -> AwarenessState {
        AwarenessState {
            name: name.into(),
            cursor: Some([1.0, 2.0]),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_and_snapshot() {
        let mut map = PresenceMap::new(ReplicaId::random());
        let bob = ReplicaId::random();
        assert!(map.apply(bob, state("Bob")));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&bob).unwrap().name, "Bob");

        map.apply(bob, state("Bobby"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.snapshot()[&bob].name, "Bobby");
    }

    #[test]
    fn test_ignores_self() {
        let local = ReplicaId::random();
        let mut map = PresenceMap::new(local);
        assert!(!map.apply(local, state("Self")));
        assert!(map.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut map = PresenceMap::new(ReplicaId::random());
        let (a, b) = (ReplicaId::random(), ReplicaId::random());
        map.apply(a, state("A"));
        map.apply(b, state("B"));
        assert!(map.remove(&a));
        assert!(!map.remove(&a));
        assert_eq!(map.len(), 1);
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_cleanup_idle() {
        let mut map = PresenceMap::new(ReplicaId::random());
        map.apply(ReplicaId::random(), state("A"));
        assert_eq!(map.cleanup_idle(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(map.cleanup_idle(Duration::from_millis(1)), 1);
        assert!(map.is_empty());
    }
}
