//! Compact summary of the operations a replica has seen.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{OperationId, ReplicaId};

/// `ReplicaId → highest counter seen from that replica`.
///
/// Entries only ever move up: [`StateVector::observe`] and
/// [`StateVector::merge`] never lower a counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `replica` (0 if none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Record that `id` has been seen.
    pub fn observe(&mut self, id: OperationId) {
        self.raise(id.replica, id.counter);
    }

    /// Raise the entry for `replica` to at least `counter`.
    pub fn raise(&mut self, replica: ReplicaId, counter: u64) {
        if counter == 0 {
            return;
        }
        let entry = self.clocks.entry(replica).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, counter) in &other.clocks {
            self.raise(*replica, *counter);
        }
    }

    /// Whether `id` is covered by this vector.
    pub fn contains(&self, id: &OperationId) -> bool {
        id.counter <= self.get(&id.replica)
    }

    /// `true` if every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(replica, counter)| self.get(replica) >= *counter)
    }

    /// Pointwise minimum over a set of vectors. Replicas missing from any
    /// vector count as 0 and drop out.
    pub fn minimum<'a>(vectors: impl IntoIterator<Item = &'a StateVector>) -> StateVector {
        let mut iter = vectors.into_iter();
        let Some(first) = iter.next() else {
            return StateVector::new();
        };
        let mut min = first.clone();
        for sv in iter {
            min.clocks = min
                .clocks
                .iter()
                .filter_map(|(replica, counter)| {
                    let other = sv.get(replica);
                    (other > 0).then(|| (*replica, (*counter).min(other)))
                })
                .collect();
        }
        min
    }

    /// Largest counter across every replica.
    pub fn max_counter(&self) -> u64 {
        self.clocks.values().copied().max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (replica, counter) in iter {
            sv.raise(replica, counter);
        }
        sv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_never_decreases() {
        let r = ReplicaId::random();
        let mut sv = StateVector::new();
        sv.observe(OperationId::new(r, 5));
        sv.observe(OperationId::new(r, 3));
        assert_eq!(sv.get(&r), 5);
        assert!(sv.contains(&OperationId::new(r, 4)));
        assert!(!sv.contains(&OperationId::new(r, 6)));
    }

    #[test]
    fn test_merge_and_dominates() {
        let a = ReplicaId::random();
        let b = ReplicaId::random();
        let mut left: StateVector = [(a, 3), (b, 1)].into_iter().collect();
        let right: StateVector = [(a, 1), (b, 4)].into_iter().collect();

        assert!(!left.dominates(&right));
        left.merge(&right);
        assert_eq!(left.get(&a), 3);
        assert_eq!(left.get(&b), 4);
        assert!(left.dominates(&right));
        assert!(left.dominates(&StateVector::new()));
    }

    #[test]
    fn test_minimum_drops_replicas_missing_anywhere() {
        let a = ReplicaId::random();
        let b = ReplicaId::random();
        let one: StateVector = [(a, 3), (b, 7)].into_iter().collect();
        let two: StateVector = [(a, 5)].into_iter().collect();

        let min = StateVector::minimum([&one, &two]);
        assert_eq!(min.get(&a), 3);
        assert_eq!(min.get(&b), 0);
        assert_eq!(min.len(), 1);
        assert!(StateVector::minimum(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_zero_counter_is_not_recorded() {
        let mut sv = StateVector::new();
        sv.raise(ReplicaId::random(), 0);
        assert!(sv.is_empty());
    }
}
