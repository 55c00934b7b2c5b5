//! Error types for document mutation and log queries.

use crate::ids::NodeId;

/// Errors raised while turning an intent into an operation, or while
/// applying a malformed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationError {
    /// Target node does not exist or is not visible.
    UnknownNode(NodeId),
    /// The root node cannot be deleted or moved.
    RootImmutable,
    /// Moving a node under itself or one of its descendants.
    CyclicMove { node: NodeId, parent: NodeId },
    /// Intent or operation is structurally invalid.
    InvalidIntent(String),
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::UnknownNode(id) => write!(f, "Unknown node: {id}"),
            OperationError::RootImmutable => write!(f, "Root node cannot be deleted or moved"),
            OperationError::CyclicMove { node, parent } => {
                write!(f, "Moving {node} under {parent} would create a cycle")
            }
            OperationError::InvalidIntent(e) => write!(f, "Invalid intent: {e}"),
        }
    }
}

impl std::error::Error for OperationError {}

/// Errors from delta computation against the operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The log cannot produce a complete delta for the requested state
    /// vector; the peer needs a full snapshot instead.
    FullResyncRequired,
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::FullResyncRequired => write!(f, "Full resync required"),
        }
    }
}

impl std::error::Error for LogError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ROOT;

    #[test]
    fn test_operation_error_display_names_each_variant() {
        let all = [
            OperationError::UnknownNode(ROOT),
            OperationError::RootImmutable,
            OperationError::CyclicMove {
                node: ROOT,
                parent: ROOT,
            },
            OperationError::InvalidIntent("empty key".into()),
        ];
        for e in &all {
            let kind = match e {
                OperationError::UnknownNode(_) => "Unknown node",
                OperationError::RootImmutable => "Root node",
                OperationError::CyclicMove { .. } => "cycle",
                OperationError::InvalidIntent(_) => "Invalid intent",
            };
            assert!(e.to_string().contains(kind), "{e}");
        }
    }
}
