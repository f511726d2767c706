//! # tandem-collab: real-time pair collaboration
//!
//! Two matched participants share one room: a replicated code editor, a
//! peer-to-peer voice connection, presence cursors, and a session that
//! survives short network drops.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │        CollabSession         │
//!                 │  (SessionLifecycle + parts)  │
//!                 └──┬─────────┬──────────┬──────┘
//!         app socket │         │          │ document channel
//!   heartbeat/reconn │         │ signal   │ (SyncStep1/2, Update,
//!                    ▼         ▼          ▼  Awareness)
//!            ┌────────────┐ ┌─────────────────┐ ┌──────────────┐
//!            │ Collab svc │ │PerfectNegotiator│ │ DocumentLink │
//!            └────────────┘ │  PeerConnection │ │  Replicator  │
//!                           │  LocalMedia     │ │  (yrs Doc)   │
//!                           └────────┬────────┘ └──────┬───────┘
//!                                    └──── relay ──────┘
//!                                  (topic fan-out, no echo)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages (signaling JSON, document frames, app messages)
//! - [`signaling`] / [`transport`]: room-scoped message and frame channels
//! - [`peer`] / [`negotiation`]: peer connection seam and perfect negotiation
//! - [`media`]: microphone, mute, speech detection
//! - [`replication`] / [`awareness`] / [`doc_link`]: CRDT text and presence
//! - [`matchmaking`] / [`socket`] / [`lifecycle`] / [`session`]: the room
//! - [`cache`]: advisory recovery cache
//! - [`relay`]: the WebSocket relay server

pub mod awareness;
pub mod cache;
pub mod config;
pub mod doc_link;
pub mod error;
pub mod lifecycle;
pub mod matchmaking;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod replication;
pub mod session;
pub mod signaling;
pub mod socket;
pub mod transport;

// Re-exports for convenience
pub use awareness::{AwarenessMap, AwarenessMessage, AwarenessState, PeerColor, TextCursor};
pub use cache::{cache_key, CacheEntry, FileRecoveryCache, MemoryRecoveryCache, RecoveryCache};
pub use config::{RelayConfig, SessionConfig};
pub use doc_link::DocumentLink;
pub use error::{
    CacheError, MediaError, PeerError, ProtocolError, RelayError, ReplicationError, ServiceError,
    SessionError, SignalError,
};
pub use lifecycle::{
    Destination, Notice, NoticeBoard, NoticeLevel, ReconnectCounter, SessionEvent,
    SessionLifecycle, SessionState, TerminationReason,
};
pub use matchmaking::{ConfirmedMatch, MatchFlow, MatchRequest, MatchState, Matchmaker};
pub use media::{LocalMedia, MediaDevices, SpeechDetector};
pub use negotiation::{NegotiationPhase, OfferDecision, PerfectNegotiator, PlaybackSink, Role};
pub use peer::{MemoryPeerConnection, PeerConnection, PeerEvent, SignalingState};
pub use protocol::{AppMessage, AppMessageKind, ClientId, DocFrame, RoomId, SignalMessage};
pub use relay::{RelayServer, RelayStats};
pub use replication::{EditorBuffer, EditorModel, Replicator, TextEdit};
pub use session::{CollabSession, RelayEndpoints, SessionParts};
pub use signaling::{MemorySignalHub, SignalingChannel, WsSignalingChannel};
pub use socket::{AppSocket, CollabService, ConnectPayload, SocketConnector, WsSocketConnector};
pub use transport::{FrameTransport, MemoryFrameTransport, RelayFrameTransport};
