//! Durable on-device cache for canvases.
//!
//! ```text
//! ┌──────────────┐  append(ops)      ┌───────────────────────────────────┐
//! │ PersistWorker│ ────────────────► │ CanvasStore (RocksDB)             │
//! │ (per session)│  save_snapshot    │                                   │
//! └──────┬───────┘ ────────────────► │ CF "snapshots" — compacted state  │
//!        │                           │ CF "oplog"     — framed op batches│
//!        │ on acquire                │ CF "sessions"  — last session     │
//!        ▼                           │ CF "metadata"  — sequences        │
//! ┌──────────────┐  load             └───────────────────────────────────┘
//! │ Replica      │ ◄──────────────── snapshot + log tail
//! └──────────────┘
//! ```

pub mod rocks;
pub mod wal;

pub use rocks::{CanvasLease, CanvasMetadata, CanvasStore, LoadedCanvas, SaveTxn, StoreConfig, StoreError};
pub use wal::LogRecord;
