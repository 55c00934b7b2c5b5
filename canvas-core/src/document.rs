//! CRDT document: a tree of typed nodes with ordered children and
//! last-writer-wins attribute maps.
//!
//! Structure:
//! ```text
//!            ROOT
//!        ┌────┴─────────────┐
//!   sequence of placement entries (RGA, "insert after entry X")
//!        │                  │
//!   entry(node A)      entry(node B)   entry(node A, moved) ...
//! ```
//!
//! - Every insert and every move creates a placement entry. A node's
//!   effective position is its highest entry that does not close a cycle.
//! - Entries are never removed, so they stay usable as ordering anchors.
//! - Deletes tombstone the node; a tombstoned node hides its subtree.
//! - Operations whose dependencies are missing are parked and retried when
//!   the missing id arrives, so application always follows causal order.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::changes::{ChangeBatch, ChangeOrigin, NodeChange};
use crate::error::OperationError;
use crate::ids::{NodeId, OperationId, ReplicaId, ROOT};
use crate::operation::{AttrValue, Attributes, Intent, OpKind, Operation};
use crate::state_vector::StateVector;

/// Result of [`Document::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Integrated (possibly together with parked operations it unblocked).
    Applied,
    /// Held back until its dependencies arrive. Not an error.
    Deferred,
    /// Already integrated or already parked; nothing changed.
    Duplicate,
}

/// Read-only view of a visible node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeView {
    pub id: NodeId,
    pub node_type: String,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
    /// Visible children in document order.
    pub children: Vec<NodeId>,
    /// Attributes with a non-null value.
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
struct Register {
    value: Option<AttrValue>,
    writer: OperationId,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    node_type: String,
    attributes: BTreeMap<String, Register>,
    deleted: Option<OperationId>,
    /// Payload dropped by garbage collection; only ids remain.
    collected: bool,
    /// Placement entry ids owned by this node, ascending. Index 0 is the
    /// insert entry because every move depends on the insert.
    placements: Vec<OperationId>,
}

impl NodeRecord {
    fn new(node_type: String) -> Self {
        Self {
            node_type,
            attributes: BTreeMap::new(),
            deleted: None,
            collected: false,
            placements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    parent: NodeId,
    node: NodeId,
    after: Option<OperationId>,
}

/// The replicated canvas document.
pub struct Document {
    replica: ReplicaId,
    /// Lamport clock: highest counter seen or produced.
    clock: u64,
    nodes: HashMap<NodeId, NodeRecord>,
    /// Placement entry index (inserts and moves).
    entries: HashMap<OperationId, Entry>,
    /// Parent → ordered entry ids.
    sequences: HashMap<NodeId, Vec<OperationId>>,
    /// Node → winning placement entry.
    effective: HashMap<NodeId, OperationId>,
    /// Parked operations by id.
    pending: HashMap<OperationId, Operation>,
    /// Missing dependency → parked operation ids waiting on it.
    waiting: HashMap<OperationId, Vec<OperationId>>,
    /// Integrated ids that create no placement entry (deletes, writes).
    applied: HashSet<OperationId>,
    /// Frontier of a restored snapshot; ids under it count as applied.
    covered: StateVector,
    placements_dirty: bool,
    changes: Vec<NodeChange>,
    version: u64,
}

impl Document {
    /// Empty document (root only) owned by `replica`.
    pub fn new(replica: ReplicaId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT, NodeRecord::new("root".to_string()));
        Self {
            replica,
            clock: 0,
            nodes,
            entries: HashMap::new(),
            sequences: HashMap::new(),
            effective: HashMap::new(),
            pending: HashMap::new(),
            waiting: HashMap::new(),
            applied: HashSet::new(),
            covered: StateVector::new(),
            placements_dirty: false,
            changes: Vec::new(),
            version: 0,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Current Lamport clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Raise the clock without applying anything (state restored from disk).
    pub fn observe_clock(&mut self, counter: u64) {
        self.clock = self.clock.max(counter);
    }

    /// Version of the last drained change batch.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of operations parked on missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ─── Applying operations ──────────────────────────────────────────

    /// Apply one operation, deferring it if its dependencies are missing.
    pub fn apply(&mut self, op: Operation) -> Result<ApplyOutcome, OperationError> {
        let outcome = self.apply_inner(op)?;
        self.finish();
        Ok(outcome)
    }

    /// Apply a batch; placement repair runs once at the end.
    ///
    /// Malformed operations are skipped and reported, the rest of the batch
    /// still applies.
    pub fn apply_batch(
        &mut self,
        ops: impl IntoIterator<Item = Operation>,
    ) -> Vec<(OperationId, Result<ApplyOutcome, OperationError>)> {
        let results = ops
            .into_iter()
            .map(|op| {
                let id = op.id;
                (id, self.apply_inner(op))
            })
            .collect();
        self.finish();
        results
    }

    fn apply_inner(&mut self, op: Operation) -> Result<ApplyOutcome, OperationError> {
        Self::validate(&op)?;
        self.clock = self.clock.max(op.id.counter);

        if self.pending.contains_key(&op.id) || self.applied.contains(&op.id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        if let Some(missing) = self.first_missing(&op) {
            log::trace!("Deferring {} {}: waiting on {missing}", op.kind.label(), op.id);
            self.park(op, missing);
            return Ok(ApplyOutcome::Deferred);
        }

        let id = op.id;
        if !self.integrate(op) {
            return Ok(ApplyOutcome::Duplicate);
        }
        self.release_waiting(id);
        Ok(ApplyOutcome::Applied)
    }

    fn validate(op: &Operation) -> Result<(), OperationError> {
        if op.id.counter == 0 || op.id.replica.is_nil() {
            return Err(OperationError::InvalidIntent(format!(
                "operation id {} is reserved",
                op.id
            )));
        }
        match &op.kind {
            OpKind::Delete { node } | OpKind::Move { node, .. } if *node == ROOT => {
                Err(OperationError::RootImmutable)
            }
            _ => Ok(()),
        }
    }

    fn is_known(&self, id: &OperationId) -> bool {
        *id == ROOT
            || self.entries.contains_key(id)
            || self.applied.contains(id)
            || self.covered.contains(id)
    }

    /// Treat every id under `held` as applied. Used when state arrives as a
    /// compacted snapshot whose superseded operations are gone; parked
    /// operations waiting on such ids are released.
    pub fn cover(&mut self, held: &StateVector) {
        self.covered.merge(held);
        let unblocked: Vec<OperationId> = self
            .waiting
            .keys()
            .filter(|id| self.covered.contains(id))
            .copied()
            .collect();
        for id in unblocked {
            self.release_waiting(id);
        }
        self.finish();
    }

    fn first_missing(&self, op: &Operation) -> Option<OperationId> {
        op.requirements().find(|dep| !self.is_known(dep))
    }

    fn park(&mut self, op: Operation, missing: OperationId) {
        self.waiting.entry(missing).or_default().push(op.id);
        self.pending.insert(op.id, op);
    }

    /// Retry every parked operation unblocked by `arrived`, transitively.
    fn release_waiting(&mut self, arrived: OperationId) {
        let mut ready = vec![arrived];
        while let Some(id) = ready.pop() {
            let Some(waiters) = self.waiting.remove(&id) else {
                continue;
            };
            for waiter in waiters {
                let Some(op) = self.pending.remove(&waiter) else {
                    continue;
                };
                if let Some(missing) = self.first_missing(&op) {
                    self.park(op, missing);
                    continue;
                }
                let op_id = op.id;
                if self.integrate(op) {
                    ready.push(op_id);
                }
            }
        }
    }

    /// Integrate a ready operation. Returns `false` if it was already known.
    fn integrate(&mut self, op: Operation) -> bool {
        let id = op.id;
        let places = matches!(op.kind, OpKind::Insert { .. } | OpKind::Move { .. });
        let fresh = self.integrate_kind(op);
        if fresh && !places {
            self.applied.insert(id);
        }
        fresh
    }

    fn integrate_kind(&mut self, op: Operation) -> bool {
        let id = op.id;
        match op.kind {
            OpKind::Insert {
                parent,
                after,
                node_type,
                attributes,
            } => {
                if self.entries.contains_key(&id) {
                    return false;
                }
                let mut record = NodeRecord::new(node_type);
                for (key, value) in attributes {
                    record.attributes.insert(
                        key,
                        Register {
                            value: Some(value),
                            writer: id,
                        },
                    );
                }
                record.placements.push(id);
                self.nodes.insert(id, record);
                self.insert_entry(id, Entry { parent, node: id, after });
                self.changes.push(NodeChange::Inserted { node: id, parent });
                true
            }
            OpKind::Delete { node } => {
                let Some(record) = self.nodes.get_mut(&node) else {
                    log::debug!("Delete {id} targets non-node {node}; absorbed");
                    return true;
                };
                match record.deleted {
                    Some(existing) if existing == id => false,
                    Some(existing) => {
                        record.deleted = Some(existing.max(id));
                        true
                    }
                    None => {
                        record.deleted = Some(id);
                        self.changes.push(NodeChange::Deleted { node });
                        true
                    }
                }
            }
            OpKind::SetAttribute { node, key, value } => {
                let Some(record) = self.nodes.get_mut(&node) else {
                    log::debug!("SetAttribute {id} targets non-node {node}; absorbed");
                    return true;
                };
                if record.collected {
                    return true;
                }
                match record.attributes.get(&key).map(|r| r.writer) {
                    Some(writer) if writer == id => false,
                    Some(writer) if writer > id => true,
                    _ => {
                        record.attributes.insert(key.clone(), Register { value, writer: id });
                        self.changes.push(NodeChange::AttributeChanged { node, key });
                        true
                    }
                }
            }
            OpKind::Move {
                node,
                parent,
                after,
            } => {
                if self.entries.contains_key(&id) {
                    return false;
                }
                if let Some(record) = self.nodes.get_mut(&node) {
                    let pos = record.placements.partition_point(|e| *e < id);
                    record.placements.insert(pos, id);
                }
                self.insert_entry(id, Entry { parent, node, after });
                true
            }
        }
    }

    /// RGA integration of a placement entry into its parent's sequence.
    fn insert_entry(&mut self, id: OperationId, entry: Entry) {
        let anchor = entry
            .after
            .filter(|a| self.entries.get(a).is_some_and(|e| e.parent == entry.parent));
        let seq = self.sequences.entry(entry.parent).or_default();
        let mut idx = match anchor {
            Some(a) => seq.iter().position(|e| *e == a).map_or(0, |p| p + 1),
            None => 0,
        };
        while idx < seq.len() && seq[idx] > id {
            idx += 1;
        }
        seq.insert(idx, id);
        self.entries.insert(id, entry);
        self.placements_dirty = true;
    }

    /// Recompute effective placements after structural changes.
    fn finish(&mut self) {
        if !self.placements_dirty {
            return;
        }
        self.placements_dirty = false;

        let mut choice: BTreeMap<NodeId, usize> = self
            .nodes
            .iter()
            .filter(|(id, record)| **id != ROOT && !record.placements.is_empty())
            .map(|(id, record)| (*id, record.placements.len() - 1))
            .collect();

        while let Some(cycle) = self.find_cycle(&choice) {
            // Demote the newest placement in the cycle that is not an insert.
            // Insert placements alone never form a cycle, so one exists.
            let victim = cycle
                .iter()
                .filter(|n| choice[*n] > 0)
                .max_by_key(|n| self.nodes[*n].placements[choice[*n]])
                .copied();
            match victim {
                Some(node) => {
                    log::debug!("Breaking move cycle by demoting {node}");
                    if let Some(idx) = choice.get_mut(&node) {
                        *idx -= 1;
                    }
                }
                None => break,
            }
        }

        let effective: HashMap<NodeId, OperationId> = choice
            .into_iter()
            .map(|(node, idx)| (node, self.nodes[&node].placements[idx]))
            .collect();

        let mut moved: Vec<(NodeId, NodeId)> = effective
            .iter()
            .filter_map(|(node, entry)| {
                let old = self.effective.get(node)?;
                (old != entry).then(|| (*node, self.entries[entry].parent))
            })
            .collect();
        moved.sort();
        self.changes.extend(
            moved
                .into_iter()
                .map(|(node, parent)| NodeChange::Moved { node, parent }),
        );
        self.effective = effective;
    }

    fn find_cycle(&self, choice: &BTreeMap<NodeId, usize>) -> Option<Vec<NodeId>> {
        let parent_of = |node: &NodeId| -> Option<NodeId> {
            let idx = choice.get(node)?;
            let entry = self.nodes.get(node)?.placements.get(*idx)?;
            self.entries.get(entry).map(|e| e.parent)
        };

        let mut done: HashSet<NodeId> = HashSet::new();
        for start in choice.keys() {
            let mut path: Vec<NodeId> = Vec::new();
            let mut on_path: HashMap<NodeId, usize> = HashMap::new();
            let mut cur = *start;
            loop {
                if done.contains(&cur) {
                    break;
                }
                if let Some(pos) = on_path.get(&cur) {
                    return Some(path[*pos..].to_vec());
                }
                on_path.insert(cur, path.len());
                path.push(cur);
                match parent_of(&cur) {
                    Some(parent) => cur = parent,
                    None => break,
                }
            }
            done.extend(path);
        }
        None
    }

    /// Drain recorded changes into one batch, if anything changed.
    pub fn take_changes(&mut self, origin: ChangeOrigin) -> Option<ChangeBatch> {
        if self.changes.is_empty() {
            return None;
        }
        self.version += 1;
        Some(ChangeBatch {
            origin,
            version: self.version,
            changes: std::mem::take(&mut self.changes),
        })
    }

    // ─── Local mutation ───────────────────────────────────────────────

    /// Translate a consumer intent into an operation stamped with this
    /// replica's id and the next Lamport counter, apply it, and return it.
    pub fn local_mutate(&mut self, intent: Intent) -> Result<Operation, OperationError> {
        let kind = self.resolve_intent(intent)?;
        self.clock += 1;
        let op = Operation::new(OperationId::new(self.replica, self.clock), kind);
        match self.apply(op.clone())? {
            ApplyOutcome::Applied => Ok(op),
            other => Err(OperationError::InvalidIntent(format!(
                "local operation {} not applied: {other:?}",
                op.id
            ))),
        }
    }

    fn resolve_intent(&self, intent: Intent) -> Result<OpKind, OperationError> {
        match intent {
            Intent::Insert {
                parent,
                after,
                node_type,
                attributes,
            } => {
                self.require_visible(parent)?;
                if node_type.is_empty() {
                    return Err(OperationError::InvalidIntent("empty node type".into()));
                }
                let after = self.resolve_anchor(parent, after)?;
                Ok(OpKind::Insert {
                    parent,
                    after,
                    node_type,
                    attributes: attributes
                        .into_iter()
                        .map(|(k, v)| (k, AttrValue(v)))
                        .collect::<Attributes>(),
                })
            }
            Intent::Delete { node } => {
                if node == ROOT {
                    return Err(OperationError::RootImmutable);
                }
                self.require_visible(node)?;
                Ok(OpKind::Delete { node })
            }
            Intent::Update { node, key, value } => {
                self.require_visible(node)?;
                if key.is_empty() {
                    return Err(OperationError::InvalidIntent("empty attribute key".into()));
                }
                Ok(OpKind::SetAttribute {
                    node,
                    key,
                    value: value.map(AttrValue),
                })
            }
            Intent::Move {
                node,
                parent,
                after,
            } => {
                if node == ROOT {
                    return Err(OperationError::RootImmutable);
                }
                self.require_visible(node)?;
                self.require_visible(parent)?;
                if after == Some(node) {
                    return Err(OperationError::InvalidIntent(
                        "cannot place a node after itself".into(),
                    ));
                }
                if self.is_ancestor_or_self(node, parent) {
                    return Err(OperationError::CyclicMove { node, parent });
                }
                let after = self.resolve_anchor(parent, after)?;
                Ok(OpKind::Move {
                    node,
                    parent,
                    after,
                })
            }
        }
    }

    fn require_visible(&self, node: NodeId) -> Result<(), OperationError> {
        if self.is_visible(node) {
            Ok(())
        } else {
            Err(OperationError::UnknownNode(node))
        }
    }

    /// Placement entry of a visible sibling under `parent`.
    fn resolve_anchor(
        &self,
        parent: NodeId,
        after: Option<NodeId>,
    ) -> Result<Option<OperationId>, OperationError> {
        let Some(sibling) = after else {
            return Ok(None);
        };
        self.require_visible(sibling)?;
        let entry = self
            .effective
            .get(&sibling)
            .filter(|e| self.entries.get(*e).is_some_and(|en| en.parent == parent))
            .ok_or_else(|| {
                OperationError::InvalidIntent(format!("{sibling} is not a child of {parent}"))
            })?;
        Ok(Some(*entry))
    }

    /// Whether `ancestor` is `node` or one of its effective ancestors.
    fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = node;
        for _ in 0..=self.nodes.len() {
            if cur == ancestor {
                return true;
            }
            match self.parent_of(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
        false
    }

    fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        let entry = self.effective.get(&node)?;
        self.entries.get(entry).map(|e| e.parent)
    }

    // ─── Queries ──────────────────────────────────────────────────────

    /// Visible iff inserted, not tombstoned, and every ancestor is visible.
    pub fn is_visible(&self, node: NodeId) -> bool {
        let mut cur = node;
        for _ in 0..=self.nodes.len() {
            if cur == ROOT {
                return true;
            }
            match self.nodes.get(&cur) {
                Some(record) if record.deleted.is_none() => {}
                _ => return false,
            }
            match self.parent_of(cur) {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
        false
    }

    /// Visible children of `parent`, in document order.
    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        let Some(seq) = self.sequences.get(&parent) else {
            return Vec::new();
        };
        seq.iter()
            .filter_map(|entry_id| {
                let entry = self.entries.get(entry_id)?;
                let wins = self.effective.get(&entry.node) == Some(entry_id);
                let alive = self
                    .nodes
                    .get(&entry.node)
                    .is_some_and(|r| r.deleted.is_none());
                (wins && alive).then_some(entry.node)
            })
            .collect()
    }

    /// Current visible state of a node.
    pub fn query(&self, node: NodeId) -> Option<NodeView> {
        if !self.is_visible(node) {
            return None;
        }
        let record = self.nodes.get(&node)?;
        Some(NodeView {
            id: node,
            node_type: record.node_type.clone(),
            parent: self.parent_of(node),
            children: self.children(node),
            attributes: record
                .attributes
                .iter()
                .filter_map(|(k, r)| r.value.as_ref().map(|v| (k.clone(), v.0.clone())))
                .collect(),
        })
    }

    /// Every visible node, depth-first in document order starting at root.
    pub fn visible_nodes(&self) -> Vec<NodeView> {
        let mut out = Vec::new();
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            if let Some(view) = self.query(id) {
                stack.extend(view.children.iter().rev().copied());
                out.push(view);
            }
        }
        out
    }

    // ─── Compaction & GC ──────────────────────────────────────────────

    /// Minimal operation set that rebuilds this document's state: every
    /// placement entry, the winning write per attribute, the winning delete,
    /// and every still-parked operation. Sorted by id, which is causal order.
    pub fn compacted_operations(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = Vec::with_capacity(self.entries.len());

        for (id, entry) in &self.entries {
            let kind = if *id == entry.node {
                let (node_type, attributes) = match self.nodes.get(id) {
                    Some(record) => (
                        record.node_type.clone(),
                        record
                            .attributes
                            .iter()
                            .filter(|(_, r)| r.writer == *id)
                            .filter_map(|(k, r)| r.value.clone().map(|v| (k.clone(), v)))
                            .collect(),
                    ),
                    None => (String::new(), Attributes::new()),
                };
                OpKind::Insert {
                    parent: entry.parent,
                    after: entry.after,
                    node_type,
                    attributes,
                }
            } else {
                OpKind::Move {
                    node: entry.node,
                    parent: entry.parent,
                    after: entry.after,
                }
            };
            ops.push(Operation::new(*id, kind));
        }

        for (node, record) in &self.nodes {
            for (key, register) in &record.attributes {
                // Initial attributes travel inside the insert, unless cleared.
                if register.writer == *node && register.value.is_some() {
                    continue;
                }
                ops.push(Operation::new(
                    register.writer,
                    OpKind::SetAttribute {
                        node: *node,
                        key: key.clone(),
                        value: register.value.clone(),
                    },
                ));
            }
            if let Some(deleted) = record.deleted {
                ops.push(Operation::new(deleted, OpKind::Delete { node: *node }));
            }
        }

        ops.extend(self.pending.values().cloned());
        ops.sort_by_key(|op| op.id);
        ops
    }

    /// Drop the payload of tombstoned nodes whose delete is covered by
    /// `observed` (the minimum frontier of every known replica). Ids and
    /// placement entries stay so late operations still resolve.
    pub fn collect_garbage(&mut self, observed: &StateVector) -> usize {
        let mut collected = 0;
        for record in self.nodes.values_mut() {
            let Some(deleted) = record.deleted else {
                continue;
            };
            if record.collected || !observed.contains(&deleted) {
                continue;
            }
            record.attributes.clear();
            record.node_type.clear();
            record.collected = true;
            collected += 1;
        }
        if collected > 0 {
            log::debug!("Collected {collected} tombstoned nodes");
        }
        collected
    }
}
