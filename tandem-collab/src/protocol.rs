//! Wire types shared by every channel of a collaboration room.
//!
//! Three independent wire formats travel between participants:
//!
//! ```text
//! ┌──────────────────┬──────────────┬──────────────────────────────────┐
//! │ channel          │ encoding     │ messages                         │
//! ├──────────────────┼──────────────┼──────────────────────────────────┤
//! │ signaling        │ JSON text    │ join | hello | offer | answer |  │
//! │                  │              │ ice  (always roomId + clientId)  │
//! │ document         │ bincode      │ DocFrame: sync1 | sync2 |        │
//! │                  │              │ update | awareness               │
//! │ application      │ JSON text    │ {user_id, match_id, message}     │
//! └──────────────────┴──────────────┴──────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Identities
// ───────────────────────────────────────────────────────────────────

/// Identifier of a two-participant room (the confirmed match id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ephemeral per-connection identity.
///
/// Distinct from the durable account id. UUID v4 keeps ids collision-free,
/// and UUID byte order equals the lexicographic order of the hyphenated
/// string, so role election compares the same way on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────────────────────────────────
// Signaling
// ───────────────────────────────────────────────────────────────────

/// SDP type of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Messages carried by the signaling channel.
///
/// Every variant is scoped to a room and stamped with its sender; receivers
/// discard anything from a foreign room or from themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    Join {
        room_id: RoomId,
        client_id: ClientId,
    },
    Hello {
        room_id: RoomId,
        client_id: ClientId,
    },
    Offer {
        room_id: RoomId,
        client_id: ClientId,
        sdp: SessionDescription,
    },
    Answer {
        room_id: RoomId,
        client_id: ClientId,
        sdp: SessionDescription,
    },
    Ice {
        room_id: RoomId,
        client_id: ClientId,
        candidate: IceCandidate,
    },
}

impl SignalMessage {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Join { room_id, .. }
            | Self::Hello { room_id, .. }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::Ice { room_id, .. } => room_id,
        }
    }

    pub fn client_id(&self) -> ClientId {
        match self {
            Self::Join { client_id, .. }
            | Self::Hello { client_id, .. }
            | Self::Offer { client_id, .. }
            | Self::Answer { client_id, .. }
            | Self::Ice { client_id, .. } => *client_id,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Hello { .. } => "hello",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
        }
    }

    /// Whether a receiver in `room` with identity `local` should process this.
    pub fn is_for(&self, room: &RoomId, local: ClientId) -> bool {
        self.room_id() == room && self.client_id() != local
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Document channel
// ───────────────────────────────────────────────────────────────────

/// Frame types on the peer-to-peer document channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Sender's state vector; the receiver answers with what is missing
    SyncStep1 = 1,
    /// Diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Awareness record update
    Awareness = 4,
}

/// One frame on the document channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocFrame {
    pub frame_type: FrameType,
    pub sender: ClientId,
    /// Sender-local Lamport clock
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl DocFrame {
    pub fn sync_step1(sender: ClientId, state_vector: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::SyncStep1,
            sender,
            clock: 0,
            payload: state_vector,
        }
    }

    pub fn sync_step2(sender: ClientId, diff: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::SyncStep2,
            sender,
            clock: 0,
            payload: diff,
        }
    }

    pub fn update(sender: ClientId, clock: u64, update: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Update,
            sender,
            clock,
            payload: update,
        }
    }

    pub fn awareness(sender: ClientId, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Awareness,
            sender,
            clock,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

// ───────────────────────────────────────────────────────────────────
// Application socket
// ───────────────────────────────────────────────────────────────────

/// The `message` field of an application-socket message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppMessageKind {
    Heartbeat,
    /// First join of the room
    Connect,
    /// Rejoin after a dropped socket
    Reconnect,
    PartnerLeft,
    MatchTerminate,
    #[serde(other)]
    Unknown,
}

/// Message on the application socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMessage {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub match_id: String,
    pub message: AppMessageKind,
}

impl AppMessage {
    pub fn new(user_id: impl Into<String>, match_id: impl Into<String>, message: AppMessageKind) -> Self {
        Self {
            user_id: user_id.into(),
            match_id: match_id.into(),
            message,
        }
    }

    pub fn heartbeat(user_id: &str, match_id: &str) -> Self {
        Self::new(user_id, match_id, AppMessageKind::Heartbeat)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new("r1")
    }

    #[test]
    fn test_signal_wire_field_names() {
        let id = ClientId::random();
        let msg = SignalMessage::Hello {
            room_id: room(),
            client_id: id,
        };
        let raw = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["clientId"], id.to_string());
    }

    #[test]
    fn test_offer_carries_sdp_type() {
        let msg = SignalMessage::Offer {
            room_id: room(),
            client_id: ClientId::random(),
            sdp: SessionDescription::offer("v=0"),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["sdp"]["type"], "offer");
        assert_eq!(value["sdp"]["sdp"], "v=0");
        assert_eq!(SignalMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_decode_browser_ice_message() {
        let id = ClientId::random();
        let raw = format!(
            r#"{{"type":"ice","roomId":"r1","clientId":"{id}","candidate":{{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}}}"#
        );
        match SignalMessage::decode(&raw).unwrap() {
            SignalMessage::Ice { candidate, client_id, .. } => {
                assert_eq!(client_id, id);
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("expected ice, got {other:?}"),
        }
    }

    #[test]
    fn test_scope_filter() {
        let me = ClientId::random();
        let other = ClientId::random();
        let from_other = SignalMessage::Join {
            room_id: room(),
            client_id: other,
        };
        let from_me = SignalMessage::Join {
            room_id: room(),
            client_id: me,
        };
        let foreign = SignalMessage::Join {
            room_id: RoomId::new("r2"),
            client_id: other,
        };
        assert!(from_other.is_for(&room(), me));
        assert!(!from_me.is_for(&room(), me));
        assert!(!foreign.is_for(&room(), me));
    }

    #[test]
    fn test_client_id_order_matches_string_order() {
        for _ in 0..64 {
            let a = ClientId::random();
            let b = ClientId::random();
            assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }
    }

    #[test]
    fn test_doc_frame_decode_garbage() {
        assert!(DocFrame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_doc_frame_large_update() {
        let frame = DocFrame::update(ClientId::random(), 9, vec![42u8; 65536]);
        let decoded = DocFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Update);
        assert_eq!(decoded.payload.len(), 65536);
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let raw = AppMessage::heartbeat("u1", "m1").encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["match_id"], "m1");
        assert_eq!(value["message"], "heartbeat");
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_inbound_unknown_message_kind() {
        let msg = AppMessage::decode(r#"{"message":"something_new"}"#).unwrap();
        assert_eq!(msg.message, AppMessageKind::Unknown);
        let msg = AppMessage::decode(r#"{"message":"partner_left"}"#).unwrap();
        assert_eq!(msg.message, AppMessageKind::PartnerLeft);
    }
}
