//! One replica of a canvas: the document plus its operation log.

use serde::{Deserialize, Serialize};

use crate::changes::{ChangeBatch, ChangeOrigin};
use crate::document::{ApplyOutcome, Document, NodeView};
use crate::error::{LogError, OperationError};
use crate::ids::{NodeId, ReplicaId};
use crate::operation::{Intent, Operation};
use crate::oplog::OperationLog;
use crate::state_vector::StateVector;

/// Serialisable replica state: a compacted operation set plus the state
/// vector it stands for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub state_vector: StateVector,
    pub operations: Vec<Operation>,
}

/// Counts from [`Replica::integrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrateReport {
    pub applied: usize,
    pub deferred: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

impl IntegrateReport {
    /// Operations that were new to this replica.
    pub fn fresh(&self) -> usize {
        self.applied + self.deferred
    }
}

pub struct Replica {
    document: Document,
    log: OperationLog,
}

impl Replica {
    pub fn new(id: ReplicaId) -> Self {
        Self {
            document: Document::new(id),
            log: OperationLog::new(id),
        }
    }

    /// Rebuild from a snapshot under a (possibly new) replica id.
    pub fn from_snapshot(id: ReplicaId, snapshot: ReplicaSnapshot) -> Self {
        let mut document = Document::new(id);
        let ReplicaSnapshot {
            state_vector,
            operations,
        } = snapshot;
        document.cover(&state_vector);
        let mut accepted = Vec::with_capacity(operations.len());
        for ((op_id, result), op) in document
            .apply_batch(operations.iter().cloned())
            .into_iter()
            .zip(operations)
        {
            match result {
                Ok(_) => accepted.push(op),
                Err(e) => log::warn!("Dropping snapshot operation {op_id}: {e}"),
            }
        }
        document.observe_clock(state_vector.max_counter());
        // Restored state is not news to anyone.
        document.take_changes(ChangeOrigin::Restore);
        Self {
            document,
            log: OperationLog::restore(id, accepted, &state_vector),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.document.replica()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut OperationLog {
        &mut self.log
    }

    pub fn state_vector(&self) -> &StateVector {
        self.log.state_vector()
    }

    /// Stamp, apply and log a consumer intent.
    pub fn local_mutate(&mut self, intent: Intent) -> Result<Operation, OperationError> {
        let op = self.document.local_mutate(intent)?;
        self.log.append(op.clone());
        Ok(op)
    }

    /// Log and apply a batch of remote operations. Known ids are skipped,
    /// malformed operations are rejected individually.
    pub fn integrate(&mut self, ops: Vec<Operation>) -> IntegrateReport {
        let mut report = IntegrateReport::default();
        let fresh: Vec<Operation> = ops
            .into_iter()
            .filter(|op| {
                let known = self.log.contains(&op.id);
                if known {
                    report.duplicates += 1;
                }
                !known
            })
            .collect();

        let results = self.document.apply_batch(fresh.iter().cloned());
        for ((op_id, result), op) in results.into_iter().zip(fresh) {
            match result {
                Ok(ApplyOutcome::Applied) => {
                    report.applied += 1;
                    self.log.append(op);
                }
                Ok(ApplyOutcome::Deferred) => {
                    report.deferred += 1;
                    self.log.append(op);
                }
                Ok(ApplyOutcome::Duplicate) => report.duplicates += 1,
                Err(e) => {
                    log::warn!("Rejected remote operation {op_id}: {e}");
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// Absorb a compacted snapshot from a peer during full resync.
    ///
    /// Operations the snapshot dropped were superseded by ones it keeps, so
    /// the local state vector is raised to the snapshot's.
    pub fn integrate_snapshot(&mut self, snapshot: ReplicaSnapshot) -> IntegrateReport {
        self.document.cover(&snapshot.state_vector);
        let report = self.integrate(snapshot.operations);
        self.log.cover(&snapshot.state_vector);
        self.document.observe_clock(snapshot.state_vector.max_counter());
        report
    }

    pub fn operations_since(&self, remote: &StateVector) -> Result<Vec<Operation>, LogError> {
        self.log.operations_since(remote)
    }

    pub fn take_changes(&mut self, origin: ChangeOrigin) -> Option<ChangeBatch> {
        self.document.take_changes(origin)
    }

    pub fn query(&self, node: NodeId) -> Option<NodeView> {
        self.document.query(node)
    }

    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        self.document.children(parent)
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            state_vector: self.log.state_vector().clone(),
            operations: self.document.compacted_operations(),
        }
    }

    /// Truncate the log up to `observed` and garbage-collect tombstones
    /// every replica has seen. Returns `(truncated ops, collected nodes)`.
    pub fn compact(&mut self, observed: &StateVector) -> (usize, usize) {
        let truncated = self.log.truncate(observed);
        let collected = self.document.collect_garbage(observed);
        (truncated, collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ROOT;
    use serde_json::json;
    use uuid::Uuid;

    fn replica(n: u128) -> ReplicaId {
        ReplicaId::from_uuid(Uuid::from_u128(n))
    }

    #[test]
    fn test_local_mutations_are_logged() {
        let mut r = Replica::new(replica(1));
        let op = r.local_mutate(Intent::insert(ROOT, None, "a")).unwrap();
        assert!(r.log().contains(&op.id));
        assert_eq!(r.state_vector().get(&replica(1)), 1);
        assert_eq!(r.children(ROOT), vec![op.id]);
    }

    #[test]
    fn test_integrate_reports_and_skips_duplicates() {
        let mut one = Replica::new(replica(1));
        let a = one.local_mutate(Intent::insert(ROOT, None, "a")).unwrap();
        let b = one.local_mutate(Intent::insert(a.id, None, "b")).unwrap();

        let mut two = Replica::new(replica(2));
        let report = two.integrate(vec![b.clone()]);
        assert_eq!(report.deferred, 1);
        let report = two.integrate(vec![a.clone(), b.clone()]);
        assert_eq!(report.applied, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(two.children(a.id), vec![b.id]);

        let batch = two.take_changes(ChangeOrigin::Remote).unwrap();
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.origin, ChangeOrigin::Remote);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_state() {
        let mut one = Replica::new(replica(1));
        let a = one
            .local_mutate(Intent::insert(ROOT, None, "a").with_attribute("k", json!("v")))
            .unwrap();
        one.local_mutate(Intent::set(a.id, "k", json!("w"))).unwrap();

        let restored = Replica::from_snapshot(replica(3), one.snapshot());
        assert_eq!(restored.id(), replica(3));
        assert_eq!(restored.query(a.id), one.query(a.id));
        assert_eq!(restored.state_vector(), one.state_vector());

        // New ops stamped after restore sort after everything restored.
        let mut restored = restored;
        let op = restored.local_mutate(Intent::insert(ROOT, None, "b")).unwrap();
        assert!(op.id.counter > one.state_vector().max_counter());
    }

    #[test]
    fn test_integrate_snapshot_covers_superseded_writes() {
        let mut one = Replica::new(replica(1));
        let a = one.local_mutate(Intent::insert(ROOT, None, "a")).unwrap();
        one.local_mutate(Intent::set(a.id, "k", json!(1))).unwrap();
        one.local_mutate(Intent::set(a.id, "k", json!(2))).unwrap();

        let mut two = Replica::new(replica(2));
        let report = two.integrate_snapshot(one.snapshot());
        assert_eq!(report.applied, 2);
        assert_eq!(two.state_vector(), one.state_vector());
        assert_eq!(two.query(a.id), one.query(a.id));
        assert!(one.operations_since(two.state_vector()).unwrap().is_empty());
    }

    #[test]
    fn test_compact_truncates_and_collects() {
        let mut one = Replica::new(replica(1));
        let a = one.local_mutate(Intent::insert(ROOT, None, "a")).unwrap();
        one.local_mutate(Intent::delete(a.id)).unwrap();
        let observed = one.state_vector().clone();
        assert_eq!(one.compact(&observed), (2, 1));
        assert!(one.log().is_empty());
        assert!(one.operations_since(&StateVector::new()).is_err());
    }
}
