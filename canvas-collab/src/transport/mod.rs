//! Ordered message pipes between a sync session and the authority.
//!
//! ```text
//!  SyncSession ──► Connector::connect(canvas) ──► Box<dyn Transport>
//!                                                   │ send / recv
//!                      ┌────────────────────────────┴──────────┐
//!                      ▼                                       ▼
//!              WsTransport (tokio-tungstenite)     MemoryTransport (mpsc)
//! ```

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use canvas_core::CanvasId;

use crate::error::SyncError;
use crate::protocol::{ProtocolError, SyncMessage};

pub use memory::{MemoryConnector, MemoryTransport};
pub use ws::{WsConnector, WsTransport};

/// A connected, ordered, bidirectional message pipe.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError>;

    /// Next message, or `Ok(None)` once the peer has closed the pipe.
    async fn recv(&mut self) -> Result<Option<SyncMessage>, ProtocolError>;

    async fn close(&mut self);
}

/// Opens transports to the authority for one canvas.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, canvas: &CanvasId) -> Result<Box<dyn Transport>, SyncError>;
}
