//! Operations: the only way a canvas document changes.
//!
//! The set of variants is closed. Every operation carries its own id and the
//! ids it causally depends on, so a receiver can hold it back until those
//! dependencies have been applied.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ids::{NodeId, OperationId};

/// Attribute value stored in the document.
///
/// Wraps a JSON value and serializes it as JSON text so compact binary
/// encoders (which cannot handle self-describing types) can carry it.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrValue(pub Value);

impl From<Value> for AttrValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Serialize for AttrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for AttrValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text)
            .map(AttrValue)
            .map_err(serde::de::Error::custom)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// Mutation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Create a node under `parent`, placed right after the placement entry
    /// `after` (or at the head when `None`). The node id is the op id.
    Insert {
        parent: NodeId,
        after: Option<OperationId>,
        node_type: String,
        attributes: Attributes,
    },
    /// Tombstone a node.
    Delete { node: NodeId },
    /// Last-writer-wins write of one attribute. `None` clears it.
    SetAttribute {
        node: NodeId,
        key: String,
        value: Option<AttrValue>,
    },
    /// Give a node a new placement entry under `parent`.
    Move {
        node: NodeId,
        parent: NodeId,
        after: Option<OperationId>,
    },
}

impl OpKind {
    /// Ids this payload refers to.
    pub fn references(&self) -> Vec<OperationId> {
        match self {
            OpKind::Insert { parent, after, .. } => {
                let mut refs = vec![*parent];
                refs.extend(after.iter().copied());
                refs
            }
            OpKind::Delete { node } | OpKind::SetAttribute { node, .. } => vec![*node],
            OpKind::Move {
                node,
                parent,
                after,
            } => {
                let mut refs = vec![*node, *parent];
                refs.extend(after.iter().copied());
                refs
            }
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::SetAttribute { .. } => "set_attribute",
            OpKind::Move { .. } => "move",
        }
    }
}

/// An immutable, uniquely identified mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    /// Causal dependencies: every id the operation refers to.
    pub deps: Vec<OperationId>,
    pub kind: OpKind,
}

impl Operation {
    /// Build an operation whose dependencies are exactly the ids it refers to.
    pub fn new(id: OperationId, kind: OpKind) -> Self {
        let mut deps = kind.references();
        deps.sort();
        deps.dedup();
        Self { id, deps, kind }
    }

    /// Everything that has to be applied before this operation: declared
    /// dependencies plus referenced ids, in case a peer under-declared.
    pub fn requirements(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.deps
            .iter()
            .copied()
            .chain(self.kind.references())
    }
}

/// High-level mutation requested by a consumer. Turned into an [`Operation`]
/// by the document, which resolves sibling references to placement entries.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Insert {
        parent: NodeId,
        /// Visible sibling to insert after; `None` inserts first.
        after: Option<NodeId>,
        node_type: String,
        attributes: BTreeMap<String, Value>,
    },
    Delete {
        node: NodeId,
    },
    Update {
        node: NodeId,
        key: String,
        value: Option<Value>,
    },
    Move {
        node: NodeId,
        parent: NodeId,
        after: Option<NodeId>,
    },
}

impl Intent {
    pub fn insert(parent: NodeId, after: Option<NodeId>, node_type: impl Into<String>) -> Self {
        Intent::Insert {
            parent,
            after,
            node_type: node_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Attach an initial attribute to an insert intent. No-op on other intents.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Intent::Insert { attributes, .. } = &mut self {
            attributes.insert(key.into(), value);
        }
        self
    }

    pub fn delete(node: NodeId) -> Self {
        Intent::Delete { node }
    }

    pub fn set(node: NodeId, key: impl Into<String>, value: Value) -> Self {
        Intent::Update {
            node,
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn clear(node: NodeId, key: impl Into<String>) -> Self {
        Intent::Update {
            node,
            key: key.into(),
            value: None,
        }
    }

    pub fn move_to(node: NodeId, parent: NodeId, after: Option<NodeId>) -> Self {
        Intent::Move {
            node,
            parent,
            after,
        }
    }
}
