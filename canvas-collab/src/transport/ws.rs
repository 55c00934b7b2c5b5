//! WebSocket transport (binary frames, one `SyncMessage` per frame).

use async_trait::async_trait;
use canvas_core::CanvasId;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{Connector, Transport};
use crate::error::SyncError;
use crate::protocol::{ProtocolError, SyncMessage};

/// Either side of a WebSocket connection.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        self.stream
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Result<Option<SyncMessage>, ProtocolError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    return SyncMessage::decode(&bytes).map(Some);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Ping/pong frames are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::debug!("WebSocket read failed: {e}");
                    return Err(ProtocolError::ConnectionClosed);
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("WebSocket close failed: {e}");
        }
    }
}

/// Connects to `{url}/{canvas_id}`.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, canvas: &CanvasId) -> Result<Box<dyn Transport>, SyncError> {
        let url = format!("{}/{}", self.url.trim_end_matches('/'), canvas);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| SyncError::Transport(format!("{url}: {e}")))?;
        log::debug!("Connected to {url}");
        Ok(Box::new(WsTransport::new(ws)))
    }
}
