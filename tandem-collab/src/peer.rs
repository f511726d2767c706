//! The peer connection seam.
//!
//! [`PeerConnection`] is the slice of a WebRTC peer connection the
//! negotiator drives: SDP creation/application, ICE, transceivers and
//! tracks, plus an event stream standing in for `onnegotiationneeded`,
//! `onicecandidate`, `ontrack` and the state-change callbacks.
//!
//! [`MemoryPeerConnection`] implements the JSEP signaling state machine in
//! memory (including implicit rollback of a pending local offer when a
//! remote offer is applied), so negotiation can run headless and be tested
//! without a network.
//!
//! ```text
//!            set_local(offer)               set_remote(answer)
//!  Stable ──────────────────► HaveLocalOffer ──────────────────► Stable
//!    │                              │
//!    │ set_remote(offer)            │ set_remote(offer): implicit rollback
//!    ▼                              ▼
//!  HaveRemoteOffer ◄────────────────┘
//!    │ set_local(answer)
//!    ▼
//!  Stable
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::PeerError;
use crate::media::LocalAudioTrack;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// JSEP signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        })
    }
}

/// Aggregate connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    fn sdp_attribute(&self) -> &'static str {
        match self {
            Self::SendRecv => "a=sendrecv",
            Self::SendOnly => "a=sendonly",
            Self::RecvOnly => "a=recvonly",
            Self::Inactive => "a=inactive",
        }
    }
}

/// Snapshot of one transceiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub id: usize,
    pub kind: MediaKind,
    pub direction: TransceiverDirection,
    /// Id of the local track attached to the sender, if any
    pub sender_track: Option<String>,
}

/// A track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

/// Events a peer connection raises towards its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    NegotiationNeeded,
    /// A local ICE candidate; `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    Track(RemoteTrack),
    ConnectionStateChanged(ConnectionState),
}

/// Operations of an underlying peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn local_description(&self) -> Option<SessionDescription>;
    fn remote_description(&self) -> Option<SessionDescription>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn transceivers(&self) -> Vec<TransceiverInfo>;
    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<TransceiverInfo, PeerError>;
    fn set_transceiver_direction(
        &self,
        id: usize,
        direction: TransceiverDirection,
    ) -> Result<(), PeerError>;

    /// Attach a local track to a sender (reusing a free transceiver of the same kind).
    fn add_track(&self, track: &LocalAudioTrack, stream_id: &str) -> Result<(), PeerError>;
    /// Detach every sender's track (`replaceTrack(null)`).
    fn detach_senders(&self);

    /// Take the event stream (can only be called once).
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    fn close(&self);
}

// ───────────────────────────────────────────────────────────────────
// In-memory implementation
// ───────────────────────────────────────────────────────────────────

/// Operation whose next call should fail (fault injection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOp {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    AddIce,
}

#[derive(Debug)]
struct Sender {
    track_id: String,
    stream_id: String,
}

#[derive(Debug)]
struct Transceiver {
    kind: MediaKind,
    direction: TransceiverDirection,
    sender: Option<Sender>,
}

struct Inner {
    state: SignalingState,
    current_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    transceivers: Vec<Transceiver>,
    remote_candidates: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrack>,
    sdp_version: u64,
    gathered: bool,
    connected: bool,
    needs_negotiation: bool,
    failures: Vec<FailOp>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Inner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn take_failure(&mut self, op: FailOp) -> bool {
        match self.failures.iter().position(|f| *f == op) {
            Some(idx) => {
                self.failures.remove(idx);
                true
            }
            None => false,
        }
    }

    fn check_open(&self) -> Result<(), PeerError> {
        if self.state == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn invalid(&self, op: &'static str) -> PeerError {
        PeerError::InvalidState {
            op,
            state: self.state.to_string(),
        }
    }

    fn mark_negotiation_needed(&mut self) {
        self.needs_negotiation = true;
        if self.state == SignalingState::Stable {
            self.emit(PeerEvent::NegotiationNeeded);
        }
    }

    /// Called whenever the machine lands in `Stable`.
    fn on_stable(&mut self) {
        if !self.connected && self.current_local.is_some() && self.current_remote.is_some() {
            self.connected = true;
            self.emit(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
        }
        if self.needs_negotiation {
            self.emit(PeerEvent::NegotiationNeeded);
        }
    }

    /// Raise `Track` for every remote sender announced in `desc` not seen yet.
    fn surface_remote_tracks(&mut self, desc: &SessionDescription) {
        for line in desc.sdp.lines() {
            let Some(msid) = line.strip_prefix("a=msid:") else { continue };
            let mut parts = msid.split_whitespace();
            let (Some(stream_id), Some(track_id)) = (parts.next(), parts.next()) else {
                continue;
            };
            if self.remote_tracks.iter().any(|t| t.id == track_id) {
                continue;
            }
            let track = RemoteTrack {
                id: track_id.to_string(),
                kind: MediaKind::Audio,
                stream_id: stream_id.to_string(),
            };
            self.remote_tracks.push(track.clone());
            self.emit(PeerEvent::Track(track));
        }
    }

    fn render_sdp(&mut self, session_id: &str) -> String {
        self.sdp_version += 1;
        let mut sdp = format!(
            "v=0\r\no=tandem {session_id} {} IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n",
            self.sdp_version
        );
        for (mid, t) in self.transceivers.iter().enumerate() {
            let media = match t.kind {
                MediaKind::Audio => "audio",
            };
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:{mid}\r\n"));
            sdp.push_str(t.direction.sdp_attribute());
            sdp.push_str("\r\n");
            if let Some(sender) = &t.sender {
                sdp.push_str(&format!("a=msid:{} {}\r\n", sender.stream_id, sender.track_id));
            }
        }
        sdp
    }
}

/// In-memory peer connection implementing the JSEP signaling state machine.
pub struct MemoryPeerConnection {
    session_id: String,
    inner: Mutex<Inner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl MemoryPeerConnection {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id: (Uuid::new_v4().as_u128() as u64).to_string(),
            inner: Mutex::new(Inner {
                state: SignalingState::Stable,
                current_local: None,
                current_remote: None,
                pending_local: None,
                pending_remote: None,
                transceivers: Vec::new(),
                remote_candidates: Vec::new(),
                remote_tracks: Vec::new(),
                sdp_version: 0,
                gathered: false,
                connected: false,
                needs_negotiation: false,
                failures: Vec::new(),
                events: tx,
            }),
            events: Mutex::new(Some(rx)),
        })
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: FailOp) {
        self.inner.lock().failures.push(op);
    }

    /// Pending (not yet answered) local and remote descriptions.
    pub fn pending_descriptions(&self) -> (Option<SessionDescription>, Option<SessionDescription>) {
        let inner = self.inner.lock();
        (inner.pending_local.clone(), inner.pending_remote.clone())
    }

    /// Remote candidates successfully applied so far.
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == SignalingState::Closed
    }

    /// Whether an offer/answer exchange has completed at least once.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().state
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let inner = self.inner.lock();
        inner.pending_local.clone().or_else(|| inner.current_local.clone())
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        let inner = self.inner.lock();
        inner.pending_remote.clone().or_else(|| inner.current_remote.clone())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.take_failure(FailOp::CreateOffer) {
            return Err(PeerError::Sdp("injected createOffer failure".into()));
        }
        Ok(SessionDescription::offer(inner.render_sdp(&self.session_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.state != SignalingState::HaveRemoteOffer {
            return Err(inner.invalid("createAnswer"));
        }
        if inner.take_failure(FailOp::CreateAnswer) {
            return Err(PeerError::Sdp("injected createAnswer failure".into()));
        }
        Ok(SessionDescription::answer(inner.render_sdp(&self.session_id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.take_failure(FailOp::SetLocal) {
            return Err(PeerError::Sdp("injected setLocalDescription failure".into()));
        }
        match desc.kind {
            SdpKind::Offer => {
                if !matches!(inner.state, SignalingState::Stable | SignalingState::HaveLocalOffer) {
                    return Err(inner.invalid("setLocalDescription(offer)"));
                }
                inner.pending_local = Some(desc);
                inner.state = SignalingState::HaveLocalOffer;
            }
            SdpKind::Answer => {
                if inner.state != SignalingState::HaveRemoteOffer {
                    return Err(inner.invalid("setLocalDescription(answer)"));
                }
                inner.current_local = Some(desc);
                inner.current_remote = inner.pending_remote.take();
                inner.state = SignalingState::Stable;
            }
        }
        inner.needs_negotiation = false;

        if !inner.gathered {
            inner.gathered = true;
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    self.session_id,
                    40_000 + (inner.sdp_version % 20_000)
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            };
            inner.emit(PeerEvent::LocalCandidate(Some(candidate)));
            inner.emit(PeerEvent::LocalCandidate(None));
        }
        if inner.state == SignalingState::Stable {
            inner.on_stable();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.take_failure(FailOp::SetRemote) {
            return Err(PeerError::Sdp("injected setRemoteDescription failure".into()));
        }
        match desc.kind {
            SdpKind::Offer => {
                if inner.state == SignalingState::HaveLocalOffer {
                    // Implicit rollback of our pending offer.
                    inner.pending_local = None;
                    inner.state = SignalingState::Stable;
                }
                if inner.state != SignalingState::Stable {
                    return Err(inner.invalid("setRemoteDescription(offer)"));
                }
                inner.surface_remote_tracks(&desc);
                inner.pending_remote = Some(desc);
                inner.state = SignalingState::HaveRemoteOffer;
            }
            SdpKind::Answer => {
                if inner.state != SignalingState::HaveLocalOffer {
                    return Err(inner.invalid("setRemoteDescription(answer)"));
                }
                inner.surface_remote_tracks(&desc);
                inner.current_local = inner.pending_local.take();
                inner.current_remote = Some(desc);
                inner.state = SignalingState::Stable;
                inner.on_stable();
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if inner.take_failure(FailOp::AddIce) {
            return Err(PeerError::Ice("injected addIceCandidate failure".into()));
        }
        if inner.pending_remote.is_none() && inner.current_remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        inner.remote_candidates.push(candidate);
        Ok(())
    }

    fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.inner
            .lock()
            .transceivers
            .iter()
            .enumerate()
            .map(|(id, t)| TransceiverInfo {
                id,
                kind: t.kind,
                direction: t.direction,
                sender_track: t.sender.as_ref().map(|s| s.track_id.clone()),
            })
            .collect()
    }

    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<TransceiverInfo, PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.transceivers.push(Transceiver {
            kind,
            direction,
            sender: None,
        });
        inner.mark_negotiation_needed();
        Ok(TransceiverInfo {
            id: inner.transceivers.len() - 1,
            kind,
            direction,
            sender_track: None,
        })
    }

    fn set_transceiver_direction(
        &self,
        id: usize,
        direction: TransceiverDirection,
    ) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let transceiver = inner
            .transceivers
            .get_mut(id)
            .ok_or_else(|| PeerError::Media(format!("no transceiver {id}")))?;
        if transceiver.direction != direction {
            transceiver.direction = direction;
            inner.mark_negotiation_needed();
        }
        Ok(())
    }

    fn add_track(&self, track: &LocalAudioTrack, stream_id: &str) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let sender = Sender {
            track_id: track.id().to_string(),
            stream_id: stream_id.to_string(),
        };
        match inner
            .transceivers
            .iter_mut()
            .find(|t| t.kind == MediaKind::Audio && t.sender.is_none())
        {
            Some(free) => free.sender = Some(sender),
            None => inner.transceivers.push(Transceiver {
                kind: MediaKind::Audio,
                direction: TransceiverDirection::SendRecv,
                sender: Some(sender),
            }),
        }
        inner.mark_negotiation_needed();
        Ok(())
    }

    fn detach_senders(&self) {
        let mut inner = self.inner.lock();
        for t in inner.transceivers.iter_mut() {
            t.sender = None;
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().take()
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SignalingState::Closed {
            inner.state = SignalingState::Closed;
            inner.emit(PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
        }
    }
}
