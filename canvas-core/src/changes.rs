//! Structural change notifications.
//!
//! A document records one [`NodeChange`] per effect while operations are
//! applied; the owner drains them into a single [`ChangeBatch`] per batch of
//! operations, so subscribers see one notification per local mutation or
//! remote delta rather than one per operation.

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// One structural effect of an applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeChange {
    Inserted { node: NodeId, parent: NodeId },
    Deleted { node: NodeId },
    AttributeChanged { node: NodeId, key: String },
    /// Effective parent or position changed (explicit move or cycle repair).
    Moved { node: NodeId, parent: NodeId },
}

impl NodeChange {
    pub fn node(&self) -> NodeId {
        match self {
            NodeChange::Inserted { node, .. }
            | NodeChange::Deleted { node }
            | NodeChange::AttributeChanged { node, .. }
            | NodeChange::Moved { node, .. } => *node,
        }
    }
}

/// Where a batch of changes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// A consumer mutation on this replica.
    Local,
    /// Operations received from the sync authority.
    Remote,
    /// State hydrated from the local store.
    Restore,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub origin: ChangeOrigin,
    /// Document version after the batch (monotonic per session).
    pub version: u64,
    pub changes: Vec<NodeChange>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether `node` is touched by this batch.
    pub fn touches(&self, node: NodeId) -> bool {
        self.changes.iter().any(|c| c.node() == node)
    }
}
