//! Error types for every layer of the collaboration stack.
//!
//! Negotiation and ICE errors never escape the negotiator (they are logged
//! and retried on the next trigger); session-level errors surface as
//! notices. These enums exist so that each seam can say precisely what
//! went wrong before that policy is applied.

use thiserror::Error;

/// Wire encode/decode failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Signaling channel failures.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failures reported by an underlying peer connection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,
    #[error("operation {op} is invalid in signaling state {state}")]
    InvalidState { op: &'static str, state: String },
    #[error("no remote description set")]
    NoRemoteDescription,
    #[error("sdp error: {0}")]
    Sdp(String),
    #[error("ice error: {0}")]
    Ice(String),
    #[error("media error: {0}")]
    Media(String),
}

/// Document replication failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReplicationError {
    #[error("crdt error: {0}")]
    Crdt(String),
    #[error("edit out of bounds: offset {offset}, len {len}, text length {text_len}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        text_len: usize,
    },
    #[error("replicator has been torn down")]
    TornDown,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<yrs::encoding::read::Error> for ReplicationError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ReplicationError::Crdt(e.to_string())
    }
}

/// Local microphone failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MediaError {
    #[error("no audio input device available")]
    NoDevice,
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("capture error: {0}")]
    Capture(String),
}

/// Recovery cache failures. Always best-effort: callers log and continue.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry corrupt: {0}")]
    Corrupt(String),
}

/// Errors from the external collaboration / matchmaking services.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Session lifecycle errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("socket error: {0}")]
    Socket(String),
    #[error("socket closed")]
    SocketClosed,
    #[error("match is not confirmed")]
    MatchNotConfirmed,
    #[error("session already terminated")]
    Terminated,
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Relay server errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("topic {0} is full")]
    TopicFull(String),
}
