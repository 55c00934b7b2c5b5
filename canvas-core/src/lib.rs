//! # canvas-core — Replicated canvas document engine
//!
//! Pure, synchronous CRDT core. No I/O and no async; the collaboration
//! crate wraps it with persistence and networking.
//!
//! ## Architecture
//!
//! ```text
//!   Intent ──► Document::local_mutate ──► Operation ──► OperationLog
//!                     ▲                                     │
//!                     │ apply / apply_batch                 │ operations_since(sv)
//!                     │                                     ▼
//!              remote Operations ◄────────────────── delta for a peer
//! ```
//!
//! ## Modules
//!
//! - [`ids`] — Replica, operation and canvas identifiers
//! - [`operation`] — Closed set of operation variants and consumer intents
//! - [`state_vector`] — Per-replica frontier used for delta computation
//! - [`document`] — Tree CRDT (RGA children, LWW attributes, tombstones)
//! - [`oplog`] — Operation log and delta queries
//! - [`replica`] — Document + log pair with snapshots
//! - [`changes`] — Batched change notifications

pub mod changes;
pub mod document;
pub mod error;
pub mod ids;
pub mod operation;
pub mod oplog;
pub mod replica;
pub mod state_vector;

pub use changes::{ChangeBatch, ChangeOrigin, NodeChange};
pub use document::{ApplyOutcome, Document, NodeView};
pub use error::{LogError, OperationError};
pub use ids::{CanvasId, Credential, InvalidCanvasId, NodeId, OperationId, ReplicaId, ROOT};
pub use operation::{AttrValue, Attributes, Intent, OpKind, Operation};
pub use oplog::OperationLog;
pub use replica::{IntegrateReport, Replica, ReplicaSnapshot};
pub use state_vector::StateVector;
