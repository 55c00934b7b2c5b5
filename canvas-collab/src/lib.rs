//! # canvas-collab — Sync, persistence and session management
//!
//! Wraps the `canvas-core` replica with a local RocksDB cache, a sync
//! session against an authority, and a manager that hands out shared
//! per-canvas handles.
//!
//! ## Architecture
//!
//! ```text
//!  consumer ──► SessionManager::acquire(canvas) ──► SessionHandle
//!                                                     │
//!                         ┌───────────────────────────┤
//!                         ▼                           ▼
//!                  PersistWorker                 SyncSession driver
//!                         │                           │ Transport
//!                         ▼                           ▼
//!                   CanvasStore (RocksDB)      Authority (rooms, fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire messages
//! - [`transport`] — WebSocket and in-process message pipes
//! - [`storage`] — RocksDB canvas store and log records
//! - [`persist`] — Background persistence worker
//! - [`session`] — Connection state machine and delta exchange
//! - [`manager`] — Reference-counted sessions per canvas
//! - [`authority`] — Reference authority server
//! - [`broadcast`] — Room fan-out
//! - [`presence`] — Ephemeral awareness state
//! - [`backoff`] — Reconnect delays

pub mod authority;
pub mod backoff;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod manager;
pub mod persist;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

pub use authority::Authority;
pub use config::{AuthorityConfig, BackoffConfig, CollabConfig, PersistConfig, SyncConfig};
pub use error::SyncError;
pub use manager::{SessionHandle, SessionManager};
pub use protocol::{AwarenessState, MessageType, SyncMessage};
pub use session::ConnectionState;
pub use storage::{CanvasStore, StoreConfig, StoreError};
pub use transport::{Connector, MemoryConnector, Transport, WsConnector};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
