//! Binary protocol spoken by the sync engine once a connection is admitted.
//!
//! Wire format (bincode-encoded, one message per binary WebSocket frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The room is not part of the message: it is fixed by the connection path.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::error::ProtocolError;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector; the server answers with the missing diff
    SyncStep1 = 1,
    /// Yrs state diff
    SyncStep2 = 2,
    /// Incremental CRDT update
    Delta = 3,
    /// Cursor/selection awareness update
    Awareness = 4,
    /// Peer metadata announcement
    PeerJoined = 5,
    /// Peer left notification (server generated)
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit peer_id. The color is derived from the id.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Awareness state for cursor/selection presence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwarenessState {
    pub cursor_x: f32,
    pub cursor_y: f32,
    /// Selected object IDs (empty = no selection)
    pub selection: Vec<Uuid>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Lamport clock for causal ordering
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            clock,
            payload,
        }
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, clock, yrs_update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, 0, state_diff)
    }

    /// Create an awareness update message.
    pub fn awareness(peer_id: Uuid, clock: u64, state: &AwarenessState) -> Self {
        Self::new(MessageType::Awareness, peer_id, clock, to_payload(state))
    }

    /// Create a peer joined announcement.
    pub fn peer_joined(info: &PeerInfo) -> Self {
        Self::new(MessageType::PeerJoined, info.peer_id, 0, to_payload(info))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse awareness payload.
    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        self.payload_as(MessageType::Awareness)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.payload_as(MessageType::PeerJoined)
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(value)
    }
}

// Payload structs are plain data; encoding them cannot fail.
fn to_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}
