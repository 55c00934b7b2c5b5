//! Operation log and delta computation.
//!
//! Operations are kept per replica in counter order. Because counters are
//! Lamport clocks, sorting any subset by [`OperationId`] yields a causal
//! order, which is what [`OperationLog::operations_since`] hands out.

use std::collections::BTreeMap;

use crate::error::LogError;
use crate::ids::{OperationId, ReplicaId};
use crate::operation::Operation;
use crate::state_vector::StateVector;

pub struct OperationLog {
    replica: ReplicaId,
    ops: BTreeMap<ReplicaId, BTreeMap<u64, Operation>>,
    state_vector: StateVector,
    /// Per replica, every counter at or below this value was truncated.
    floor: StateVector,
    /// Best known frontier of the remote side.
    remote: StateVector,
}

impl OperationLog {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            ops: BTreeMap::new(),
            state_vector: StateVector::new(),
            floor: StateVector::new(),
            remote: StateVector::new(),
        }
    }

    /// Rebuild a log from a compacted operation set.
    ///
    /// A compacted set only drops operations that are superseded by a
    /// higher-id operation it keeps, so it still answers deltas for any
    /// remote frontier and needs no truncation floor.
    pub fn restore(
        replica: ReplicaId,
        ops: impl IntoIterator<Item = Operation>,
        state_vector: &StateVector,
    ) -> Self {
        let mut log = Self::new(replica);
        for op in ops {
            log.append(op);
        }
        log.state_vector.merge(state_vector);
        log
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Record an operation. Returns `false` if the id is already present.
    pub fn append(&mut self, op: Operation) -> bool {
        let id = op.id;
        if self.floor.contains(&id) {
            return false;
        }
        let per_replica = self.ops.entry(id.replica).or_default();
        if per_replica.contains_key(&id.counter) {
            return false;
        }
        per_replica.insert(id.counter, op);
        self.state_vector.observe(id);
        true
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.floor.contains(id)
            || self
                .ops
                .get(&id.replica)
                .is_some_and(|m| m.contains_key(&id.counter))
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.ops.get(&id.replica)?.get(&id.counter)
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn floor(&self) -> &StateVector {
        &self.floor
    }

    pub fn len(&self) -> usize {
        self.ops.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.values().all(BTreeMap::is_empty)
    }

    /// Operations held here that `remote` lacks, in causal order.
    pub fn operations_since(&self, remote: &StateVector) -> Result<Vec<Operation>, LogError> {
        // A peer claiming more of our own history than we produced is
        // replaying a different lineage.
        if remote.get(&self.replica) > self.state_vector.get(&self.replica) {
            log::warn!(
                "Remote claims counter {} for {} but log only reaches {}",
                remote.get(&self.replica),
                self.replica,
                self.state_vector.get(&self.replica)
            );
            return Err(LogError::FullResyncRequired);
        }
        for (replica, floor) in self.floor.iter() {
            if remote.get(replica) < *floor {
                log::debug!(
                    "Remote at {} for {replica} is below truncation floor {floor}",
                    remote.get(replica)
                );
                return Err(LogError::FullResyncRequired);
            }
        }

        let mut out: Vec<Operation> = self
            .ops
            .iter()
            .flat_map(|(replica, ops)| {
                let seen = remote.get(replica);
                ops.range(seen.saturating_add(1)..).map(|(_, op)| op.clone())
            })
            .collect();
        out.sort_by_key(|op| op.id);
        Ok(out)
    }

    /// Mark everything in `held` as present without storing it. Used after
    /// absorbing a compacted set, whose superseded operations are gone.
    pub fn cover(&mut self, held: &StateVector) {
        self.state_vector.merge(held);
    }

    /// Informational merge of what the remote side is known to hold.
    pub fn merge_remote_state_vector(&mut self, remote: &StateVector) {
        self.remote.merge(remote);
    }

    pub fn remote_state_vector(&self) -> &StateVector {
        &self.remote
    }

    /// Whether everything logged here is known to be held remotely.
    pub fn is_acknowledged(&self) -> bool {
        self.remote.dominates(&self.state_vector)
    }

    /// Drop every operation covered by `upto` and raise the truncation floor.
    /// Returns the number of operations removed.
    pub fn truncate(&mut self, upto: &StateVector) -> usize {
        let mut removed = 0;
        for (replica, counter) in upto.iter() {
            let bound = (*counter).min(self.state_vector.get(replica));
            if bound == 0 {
                continue;
            }
            if let Some(ops) = self.ops.get_mut(replica) {
                let kept = ops.split_off(&(bound + 1));
                removed += ops.len();
                *ops = kept;
            }
            self.floor.raise(*replica, bound);
        }
        self.ops.retain(|_, ops| !ops.is_empty());
        if removed > 0 {
            log::debug!("Truncated {removed} operations from log");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ROOT;
    use crate::operation::{Attributes, OpKind};
    use uuid::Uuid;

    fn replica(n: u128) -> ReplicaId {
        ReplicaId::from_uuid(Uuid::from_u128(n))
    }

    fn insert(replica: ReplicaId, counter: u64) -> Operation {
        Operation::new(
            OperationId::new(replica, counter),
            OpKind::Insert {
                parent: ROOT,
                after: None,
                node_type: "n".into(),
                attributes: Attributes::new(),
            },
        )
    }

    #[test]
    fn test_append_tracks_state_vector_and_rejects_duplicates() {
        let r = replica(1);
        let mut log = OperationLog::new(r);
        assert!(log.append(insert(r, 1)));
        assert!(log.append(insert(r, 4)));
        assert!(!log.append(insert(r, 4)));
        assert_eq!(log.state_vector().get(&r), 4);
        assert_eq!(log.len(), 2);
        assert!(log.contains(&OperationId::new(r, 1)));
        assert!(!log.contains(&OperationId::new(r, 2)));
    }

    #[test]
    fn test_operations_since_returns_missing_in_causal_order() {
        let (a, b) = (replica(1), replica(2));
        let mut log = OperationLog::new(a);
        for op in [insert(a, 1), insert(b, 2), insert(a, 3), insert(b, 5)] {
            log.append(op);
        }

        let remote: StateVector = [(a, 1)].into_iter().collect();
        let ids: Vec<OperationId> = log
            .operations_since(&remote)
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                OperationId::new(b, 2),
                OperationId::new(a, 3),
                OperationId::new(b, 5)
            ]
        );
        assert!(log
            .operations_since(log.state_vector())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_remote_ahead_of_own_history_requires_resync() {
        let a = replica(1);
        let mut log = OperationLog::new(a);
        log.append(insert(a, 2));
        let remote: StateVector = [(a, 9)].into_iter().collect();
        assert_eq!(
            log.operations_since(&remote),
            Err(LogError::FullResyncRequired)
        );
    }

    #[test]
    fn test_truncated_log_requires_resync_for_lagging_remote() {
        let (a, b) = (replica(1), replica(2));
        let mut log = OperationLog::new(a);
        for c in 1..=5 {
            log.append(insert(b, c));
        }
        let upto: StateVector = [(b, 3)].into_iter().collect();
        assert_eq!(log.truncate(&upto), 3);
        assert_eq!(log.len(), 2);
        assert!(log.contains(&OperationId::new(b, 2)));
        assert!(!log.append(insert(b, 2)));

        assert_eq!(
            log.operations_since(&StateVector::new()),
            Err(LogError::FullResyncRequired)
        );
        let caught_up: StateVector = [(b, 3)].into_iter().collect();
        assert_eq!(log.operations_since(&caught_up).unwrap().len(), 2);
    }

    #[test]
    fn test_restore_keeps_state_vector() {
        let a = replica(1);
        let sv: StateVector = [(a, 10)].into_iter().collect();
        let log = OperationLog::restore(replica(7), vec![insert(a, 4)], &sv);
        assert_eq!(log.state_vector().get(&a), 10);
        assert_eq!(log.len(), 1);
        assert_eq!(log.replica(), replica(7));
    }

    #[test]
    fn test_cover_raises_state_vector_only() {
        let a = replica(1);
        let mut log = OperationLog::new(replica(2));
        log.append(insert(a, 1));
        log.cover(&[(a, 6)].into_iter().collect());
        assert_eq!(log.state_vector().get(&a), 6);
        assert_eq!(log.len(), 1);
        assert!(!log.contains(&OperationId::new(a, 4)));
        let behind: StateVector = [(a, 3)].into_iter().collect();
        assert!(log.operations_since(&behind).unwrap().is_empty());
    }

    #[test]
    fn test_remote_state_vector_acknowledgement() {
        let a = replica(1);
        let mut log = OperationLog::new(a);
        log.append(insert(a, 1));
        assert!(!log.is_acknowledged());
        log.merge_remote_state_vector(&[(a, 1)].into_iter().collect());
        assert!(log.is_acknowledged());
        assert_eq!(log.remote_state_vector().get(&a), 1);
    }
}
