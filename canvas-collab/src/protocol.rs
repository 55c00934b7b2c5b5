//! Binary protocol between a sync session and the authority.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬───────────┬──────────┐
//! │ msg_type │ replica_id │ canvas_id │ payload  │
//! │ 1 byte   │ 16 bytes   │ len + str │ variable │
//! └──────────┴────────────┴───────────┴──────────┘
//! ```
//!
//! Handshake:
//! ```text
//! client                               authority
//!   │ Hello{credential} + SyncStep1(sv) ──►│
//!   │◄── SyncStep1(sv) + SyncStep2(delta)  │   (or Resync)
//!   │ SyncStep2(delta) ───────────────────►│
//!   │◄──────────────────────────── Ack(sv) │
//!   │ Ack(sv) ────────────────────────────►│
//! ```
//!
//! Operation batches are order-independent on the wire; the receiver
//! enforces causal order.

use canvas_core::{CanvasId, Credential, NodeId, Operation, ReplicaId, StateVector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bumped on incompatible wire changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Identify replica, canvas and credential
    Hello = 1,
    /// State vector of the sender
    SyncStep1 = 2,
    /// Operations the receiver lacks
    SyncStep2 = 3,
    /// Incremental operations after the handshake
    Update = 4,
    /// Ephemeral cursor/selection state
    Awareness = 5,
    /// State vector after applying received operations
    Ack = 6,
    /// Authority cannot compute a delta for the client's state vector
    Resync = 7,
    /// Client asks for the full compacted state
    ResyncRequest = 8,
    /// Peer left the canvas
    PeerLeft = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Payload of [`MessageType::Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub credential: Credential,
    pub protocol_version: u32,
}

/// Awareness state for cursor/selection presence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// Display name
    pub name: String,
    /// Cursor position in canvas coordinates
    pub cursor: Option<[f32; 2]>,
    /// Selected nodes (empty = no selection)
    pub selection: Vec<NodeId>,
    /// Node being edited, if any
    pub editing: Option<NodeId>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender, or the origin replica for relayed messages
    pub replica_id: ReplicaId,
    pub canvas_id: CanvasId,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn empty(msg_type: MessageType, replica_id: ReplicaId, canvas_id: CanvasId) -> Self {
        Self {
            msg_type,
            replica_id,
            canvas_id,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        replica_id: ReplicaId,
        canvas_id: CanvasId,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            replica_id,
            canvas_id,
            payload,
        })
    }

    /// Create a hello message carrying the session credential.
    pub fn hello(
        replica_id: ReplicaId,
        canvas_id: CanvasId,
        credential: &Credential,
    ) -> Result<Self, ProtocolError> {
        let hello = Hello {
            credential: credential.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        Self::with_payload(MessageType::Hello, replica_id, canvas_id, &hello)
    }

    /// Create a sync step 1 (state vector announcement).
    pub fn sync_step1(
        replica_id: ReplicaId,
        canvas_id: CanvasId,
        state_vector: &StateVector,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::SyncStep1, replica_id, canvas_id, state_vector)
    }

    /// Create a sync step 2 (operations the peer lacks).
    pub fn sync_step2(
        replica_id: ReplicaId,
        canvas_id: CanvasId,
        operations: &[Operation],
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::SyncStep2, replica_id, canvas_id, &operations)
    }

    /// Create an incremental update.
    pub fn update(
        replica_id: ReplicaId,
        canvas_id: CanvasId,
        operations: &[Operation],
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Update, replica_id, canvas_id, &operations)
    }

    /// Create an awareness update message.
    pub fn awareness(
        replica_id: ReplicaId,
        canvas_id: CanvasId,
        state: &AwarenessState,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Awareness, replica_id, canvas_id, state)
    }

    /// Create an acknowledgement carrying the sender's state vector.
    pub fn ack(
        replica_id: ReplicaId,
        canvas_id: CanvasId,
        state_vector: &StateVector,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Ack, replica_id, canvas_id, state_vector)
    }

    /// Tell the client its state vector cannot be served incrementally.
    pub fn resync(replica_id: ReplicaId, canvas_id: CanvasId) -> Self {
        Self::empty(MessageType::Resync, replica_id, canvas_id)
    }

    /// Ask the authority for its full compacted state.
    pub fn resync_request(replica_id: ReplicaId, canvas_id: CanvasId) -> Self {
        Self::empty(MessageType::ResyncRequest, replica_id, canvas_id)
    }

    /// Create a peer left notification.
    pub fn peer_left(replica_id: ReplicaId, canvas_id: CanvasId) -> Self {
        Self::empty(MessageType::PeerLeft, replica_id, canvas_id)
    }

    /// Create a ping message.
    pub fn ping(replica_id: ReplicaId, canvas_id: CanvasId) -> Self {
        Self::empty(MessageType::Ping, replica_id, canvas_id)
    }

    /// Create a pong message.
    pub fn pong(replica_id: ReplicaId, canvas_id: CanvasId) -> Self {
        Self::empty(MessageType::Pong, replica_id, canvas_id)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn decode_payload<T: DeserializeOwned>(
        &self,
        expected: &[MessageType],
    ) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    /// Parse hello payload.
    pub fn hello_payload(&self) -> Result<Hello, ProtocolError> {
        self.decode_payload(&[MessageType::Hello])
    }

    /// Parse state vector payload (`SyncStep1` or `Ack`).
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.decode_payload(&[MessageType::SyncStep1, MessageType::Ack])
    }

    /// Parse operations payload (`SyncStep2` or `Update`).
    pub fn operations(&self) -> Result<Vec<Operation>, ProtocolError> {
        self.decode_payload(&[MessageType::SyncStep2, MessageType::Update])
    }

    /// Parse awareness payload.
    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        self.decode_payload(&[MessageType::Awareness])
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
    /// Peer sent something that does not fit the current protocol phase
    Unexpected(MessageType),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::Unexpected(t) => write!(f, "Unexpected {t:?} message"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{Intent, Replica, ROOT};
    use serde_json::json;

    fn canvas() -> CanvasId {
        CanvasId::parse("canvas-1").unwrap()
    }

    #[test]
    fn test_update_roundtrip_carries_operations() {
        let mut replica = Replica::new(ReplicaId::random());
        let op = replica
            .local_mutate(Intent::insert(ROOT, None, "rect").with_attribute("fill", json!("#f00")))
            .unwrap();

        let msg = SyncMessage::update(replica.id(), canvas(), &[op.clone()]).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.replica_id, replica.id());
        assert_eq!(decoded.canvas_id, canvas());
        assert_eq!(decoded.operations().unwrap(), vec![op]);
    }

    #[test]
    fn test_state_vector_payloads() {
        let r = ReplicaId::random();
        let sv: StateVector = [(r, 12)].into_iter().collect();

        let step1 = SyncMessage::sync_step1(r, canvas(), &sv).unwrap();
        let ack = SyncMessage::ack(r, canvas(), &sv).unwrap();
        for msg in [step1, ack] {
            let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded.state_vector().unwrap(), sv);
        }
    }

    #[test]
    fn test_hello_carries_credential() {
        let msg = SyncMessage::hello(ReplicaId::random(), canvas(), &Credential::new("tok")).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let hello = decoded.hello_payload().unwrap();
        assert_eq!(hello.credential.expose(), "tok");
        assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_awareness_roundtrip() {
        let state = AwarenessState {
            name: "Alice".into(),
            cursor: Some([10.5, 20.25]),
            selection: vec![ROOT],
            editing: None,
        };
        let msg = SyncMessage::awareness(ReplicaId::random(), canvas(), &state).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_state().unwrap(), state);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::ping(ReplicaId::random(), canvas());
        assert_eq!(msg.operations(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(msg.state_vector(), Err(ProtocolError::InvalidMessageType));
        assert!(msg.awareness_state().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Hello as u8, 1);
        assert_eq!(MessageType::SyncStep1 as u8, 2);
        assert_eq!(MessageType::SyncStep2 as u8, 3);
        assert_eq!(MessageType::Update as u8, 4);
        assert_eq!(MessageType::Awareness as u8, 5);
        assert_eq!(MessageType::Ack as u8, 6);
        assert_eq!(MessageType::Resync as u8, 7);
        assert_eq!(MessageType::ResyncRequest as u8, 8);
        assert_eq!(MessageType::PeerLeft as u8, 9);
        assert_eq!(MessageType::Ping as u8, 10);
        assert_eq!(MessageType::Pong as u8, 11);
    }

    #[test]
    fn test_header_overhead_is_small() {
        let msg = SyncMessage::resync(ReplicaId::random(), canvas());
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 40, "Encoded size {} too large", encoded.len());
    }
}
