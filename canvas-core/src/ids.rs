//! Identifiers shared by every replica of a canvas.
//!
//! Ordering of [`OperationId`] is the tie-break used everywhere a CRDT has to
//! pick a winner between concurrent writes: compare the Lamport counter first,
//! then the replica bytes. Higher id wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of one replica (one client process session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Reserved id used for the document root. Never handed to a live replica.
    pub const NIL: ReplicaId = ReplicaId(Uuid::nil());

    /// Fresh random replica id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell replicas apart in logs
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// `(counter, replica)` pair stamped on every operation.
///
/// `counter` is a Lamport clock, so within one replica it strictly increases
/// and every causal dependency of an operation has a smaller counter.
/// Field order matters: the derived `Ord` is the pinned tie-break comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl OperationId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { counter, replica }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}

/// Node identifiers are the id of the insert operation that created them.
pub type NodeId = OperationId;

/// Id of the root node, present in every document.
pub const ROOT: NodeId = OperationId {
    counter: 0,
    replica: ReplicaId::NIL,
};

const MAX_CANVAS_ID_LEN: usize = 128;

/// Validated canvas identifier, used as the storage and routing key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanvasId(String);

impl CanvasId {
    /// Parse a canvas id. Accepts 1..=128 bytes of `[A-Za-z0-9._:-]`.
    pub fn parse(raw: &str) -> Result<Self, InvalidCanvasId> {
        if raw.is_empty() {
            return Err(InvalidCanvasId::Empty);
        }
        if raw.len() > MAX_CANVAS_ID_LEN {
            return Err(InvalidCanvasId::TooLong(raw.len()));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(InvalidCanvasId::InvalidChar(c));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanvasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a canvas id was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidCanvasId {
    Empty,
    TooLong(usize),
    InvalidChar(char),
}

impl fmt::Display for InvalidCanvasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidCanvasId::Empty => write!(f, "canvas id is empty"),
            InvalidCanvasId::TooLong(len) => {
                write!(f, "canvas id is {len} bytes (max {MAX_CANVAS_ID_LEN})")
            }
            InvalidCanvasId::InvalidChar(c) => write!(f, "canvas id contains {c:?}"),
        }
    }
}

impl std::error::Error for InvalidCanvasId {}

/// Opaque session token handed to the authority at connect time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_orders_by_counter_then_replica() {
        let low = ReplicaId::from_uuid(Uuid::from_u128(1));
        let high = ReplicaId::from_uuid(Uuid::from_u128(2));

        assert!(OperationId::new(high, 4) < OperationId::new(low, 5));
        assert!(OperationId::new(low, 5) < OperationId::new(high, 5));
        assert_eq!(
            OperationId::new(low, 5).max(OperationId::new(high, 5)).replica,
            high
        );
    }

    #[test]
    fn test_root_is_smallest_id() {
        let any = OperationId::new(ReplicaId::random(), 1);
        assert!(ROOT < any);
        assert!(ROOT.replica.is_nil());
    }

    #[test]
    fn test_canvas_id_validation() {
        assert!(CanvasId::parse("canvas-1").is_ok());
        assert!(CanvasId::parse("team:abc_01.v2").is_ok());
        assert_eq!(CanvasId::parse(""), Err(InvalidCanvasId::Empty));
        assert_eq!(
            CanvasId::parse("a/b"),
            Err(InvalidCanvasId::InvalidChar('/'))
        );
        let long = "x".repeat(129);
        assert_eq!(CanvasId::parse(&long), Err(InvalidCanvasId::TooLong(129)));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("secret-token");
        assert_eq!(format!("{cred:?}"), "Credential(***)");
        assert_eq!(cred.expose(), "secret-token");
        assert!(Credential::new("  ").is_empty());
    }
}
