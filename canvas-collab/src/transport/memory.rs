//! In-process transport to an [`Authority`].
//!
//! Messages cross the channel in their binary wire form. A link can be cut
//! from the outside (`MemoryConnector::drop_links`) and the connector can be
//! switched offline, which is how tests simulate network loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use canvas_core::CanvasId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Connector, Transport};
use crate::authority::Authority;
use crate::error::SyncError;
use crate::protocol::{ProtocolError, SyncMessage};

/// One end of an in-memory link.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    link: CancellationToken,
}

impl MemoryTransport {
    /// Two connected ends sharing one link token.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let link = CancellationToken::new();
        (
            Self {
                tx: a_tx,
                rx: b_rx,
                link: link.clone(),
            },
            Self {
                tx: b_tx,
                rx: a_rx,
                link,
            },
        )
    }

    pub fn link(&self) -> CancellationToken {
        self.link.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        if self.link.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.tx
            .send(msg.encode()?)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Option<SyncMessage>, ProtocolError> {
        tokio::select! {
            biased;
            _ = self.link.cancelled() => Ok(None),
            bytes = self.rx.recv() => match bytes {
                Some(bytes) => SyncMessage::decode(&bytes).map(Some),
                None => Ok(None),
            },
        }
    }

    async fn close(&mut self) {
        self.link.cancel();
    }
}

/// Connects sessions to an in-process authority.
pub struct MemoryConnector {
    authority: Authority,
    online: AtomicBool,
    links: Mutex<Vec<CancellationToken>>,
}

impl MemoryConnector {
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            online: AtomicBool::new(true),
            links: Mutex::new(Vec::new()),
        }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Refuse (or accept again) new connections.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Cut every live link. Returns how many were open.
    pub fn drop_links(&self) -> usize {
        let mut links = crate::lock(&self.links);
        let open = links.iter().filter(|l| !l.is_cancelled()).count();
        for link in links.drain(..) {
            link.cancel();
        }
        open
    }

    /// Go offline and cut every live link.
    pub fn disconnect_all(&self) -> usize {
        self.set_online(false);
        self.drop_links()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, canvas: &CanvasId) -> Result<Box<dyn Transport>, SyncError> {
        if !self.is_online() {
            return Err(SyncError::Transport(format!(
                "authority unreachable for {canvas}"
            )));
        }
        let (client, server) = MemoryTransport::pair();
        {
            let mut links = crate::lock(&self.links);
            links.retain(|l| !l.is_cancelled());
            links.push(client.link());
        }
        let authority = self.authority.clone();
        tokio::spawn(async move {
            authority.handle_peer(Box::new(server)).await;
        });
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::ReplicaId;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (mut a, mut b) = MemoryTransport::pair();
        let canvas = CanvasId::parse("c").unwrap();
        let r = ReplicaId::random();
        a.send(&SyncMessage::ping(r, canvas.clone())).await.unwrap();
        a.send(&SyncMessage::pong(r, canvas.clone())).await.unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap(), SyncMessage::ping(r, canvas.clone()));
        assert_eq!(b.recv().await.unwrap().unwrap(), SyncMessage::pong(r, canvas));
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.close().await;
        assert_eq!(b.recv().await.unwrap(), None);
        let msg = SyncMessage::ping(ReplicaId::random(), CanvasId::parse("c").unwrap());
        assert_eq!(b.send(&msg).await, Err(ProtocolError::ConnectionClosed));
    }
}
