//! Error taxonomy of the collaboration layer.
//!
//! Only configuration errors (`InvalidCanvasId`, `MissingCredential`) reach
//! the caller of `acquire`. Transport and storage faults are recovered in
//! the background and logged; they appear here so internal paths can
//! propagate them with `?`.

use canvas_core::{InvalidCanvasId, OperationError};

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Clone)]
pub enum SyncError {
    /// Canvas id failed validation
    InvalidCanvasId(InvalidCanvasId),
    /// Empty credential supplied at acquire
    MissingCredential,
    /// Local store could not be opened, read or written
    PersistenceUnavailable(StoreError),
    /// Connect or send failure
    Transport(String),
    /// Authority cannot serve our state vector incrementally
    ProtocolMismatch(String),
    /// Local log is inconsistent
    CorruptLog(String),
    /// Consumer intent was rejected
    Operation(OperationError),
    /// Malformed or unexpected message
    Protocol(ProtocolError),
    /// The session has been released
    SessionClosed,
    /// A bounded wait elapsed
    Timeout(&'static str),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::InvalidCanvasId(e) => write!(f, "Invalid canvas id: {e}"),
            SyncError::MissingCredential => write!(f, "Missing session credential"),
            SyncError::PersistenceUnavailable(e) => write!(f, "Persistence unavailable: {e}"),
            SyncError::Transport(e) => write!(f, "Transport error: {e}"),
            SyncError::ProtocolMismatch(e) => write!(f, "Protocol mismatch: {e}"),
            SyncError::CorruptLog(e) => write!(f, "Corrupt local log: {e}"),
            SyncError::Operation(e) => write!(f, "{e}"),
            SyncError::Protocol(e) => write!(f, "Protocol error: {e}"),
            SyncError::SessionClosed => write!(f, "Session closed"),
            SyncError::Timeout(what) => write!(f, "Timed out waiting for {what}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<InvalidCanvasId> for SyncError {
    fn from(e: InvalidCanvasId) -> Self {
        SyncError::InvalidCanvasId(e)
    }
}

impl From<OperationError> for SyncError {
    fn from(e: OperationError) -> Self {
        SyncError::Operation(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt(msg) => SyncError::CorruptLog(msg),
            other => SyncError::PersistenceUnavailable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_split_by_kind() {
        assert!(matches!(
            SyncError::from(StoreError::Corrupt("bad".into())),
            SyncError::CorruptLog(_)
        ));
        assert!(matches!(
            SyncError::from(StoreError::DatabaseError("io".into())),
            SyncError::PersistenceUnavailable(_)
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            SyncError::Timeout("ack").to_string(),
            "Timed out waiting for ack"
        );
        assert_eq!(SyncError::MissingCredential.to_string(), "Missing session credential");
    }
}
