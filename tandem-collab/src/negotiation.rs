//! Perfect negotiation of the room's single audio connection.
//!
//! Neither side is told who offers. Both announce `hello` on join; the two
//! client ids then decide the roles once for the life of the room:
//!
//! ```text
//!   local id > remote id  →  polite    (yields on collision, rolls back)
//!   local id < remote id  →  impolite  (its offer always wins)
//! ```
//!
//! Every signaling message and every peer-connection event funnels through
//! one dispatch point ([`PerfectNegotiator::handle_signal`] and
//! [`PerfectNegotiator::handle_peer_event`]). Negotiation state is a single
//! [`NegotiationPhase`] re-derived from the connection's signaling state on
//! every exit path, so a failed step can never leave a stale
//! "making offer" behind.
//!
//! Failures are logged, never returned: the connection stays where it is
//! and the next natural trigger retries.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::media::LocalStream;
use crate::peer::{
    MediaKind, PeerConnection, PeerEvent, RemoteTrack, SignalingState, TransceiverDirection,
};
use crate::protocol::{ClientId, IceCandidate, RoomId, SessionDescription, SignalMessage};
use crate::signaling::SignalingChannel;

/// Negotiation role, elected once per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    /// The larger id is polite.
    pub fn elect(local: ClientId, remote: ClientId) -> Self {
        if local > remote {
            Role::Polite
        } else {
            Role::Impolite
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Polite => "polite",
            Role::Impolite => "impolite",
        })
    }
}

/// Where the negotiator is in an offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    /// Creating and applying a local offer
    MakingOffer,
    /// Local offer sent, waiting for the answer
    AwaitingAnswer,
    /// Remote offer applied, answer not yet applied
    Answering,
}

/// Outcome of the most recent inbound offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Accepted,
    /// Dropped by the collision rule; ICE for it is expected to fail
    Ignored,
}

// ───────────────────────────────────────────────────────────────────
// Playback
// ───────────────────────────────────────────────────────────────────

/// Output bound to the remote audio stream.
pub trait PlaybackSink: Send + Sync {
    fn bind(&mut self, track: &RemoteTrack);
    fn release(&mut self);
}

/// Creates the playback sink on the first remote track.
pub type PlaybackFactory = Box<dyn Fn() -> Box<dyn PlaybackSink> + Send + Sync>;

/// Playback sink that records which streams it was bound to.
#[derive(Clone, Default)]
pub struct RecordingPlayback {
    state: Arc<Mutex<RecordingState>>,
}

#[derive(Default)]
struct RecordingState {
    created: usize,
    bound: Vec<String>,
    released: bool,
}

impl RecordingPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory handing out sinks that share this recorder.
    pub fn factory(&self) -> PlaybackFactory {
        let recorder = self.clone();
        Box::new(move || {
            recorder.state.lock().created += 1;
            Box::new(recorder.clone())
        })
    }

    /// Number of sinks created.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    /// Stream ids bound so far, in order.
    pub fn bound_streams(&self) -> Vec<String> {
        self.state.lock().bound.clone()
    }

    pub fn released(&self) -> bool {
        self.state.lock().released
    }
}

impl PlaybackSink for RecordingPlayback {
    fn bind(&mut self, track: &RemoteTrack) {
        self.state.lock().bound.push(track.stream_id.clone());
    }

    fn release(&mut self) {
        self.state.lock().released = true;
    }
}

// ───────────────────────────────────────────────────────────────────
// Negotiator
// ───────────────────────────────────────────────────────────────────

/// Owns the room's peer connection and runs perfect negotiation over it.
pub struct PerfectNegotiator {
    room: RoomId,
    local_id: ClientId,
    pc: Arc<dyn PeerConnection>,
    signaling: Arc<dyn SignalingChannel>,
    role: Option<Role>,
    phase: NegotiationPhase,
    last_offer: OfferDecision,
    /// Negotiation was requested before anyone was there to answer
    deferred_offer: bool,
    local_stream: Option<LocalStream>,
    playback_factory: PlaybackFactory,
    playback: Option<Box<dyn PlaybackSink>>,
    closed: bool,
}

impl PerfectNegotiator {
    pub fn new(
        room: RoomId,
        local_id: ClientId,
        pc: Arc<dyn PeerConnection>,
        signaling: Arc<dyn SignalingChannel>,
        playback_factory: PlaybackFactory,
    ) -> Self {
        Self {
            room,
            local_id,
            pc,
            signaling,
            role: None,
            phase: NegotiationPhase::Stable,
            last_offer: OfferDecision::Accepted,
            deferred_offer: false,
            local_stream: None,
            playback_factory,
            playback: None,
            closed: false,
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn last_offer(&self) -> OfferDecision {
        self.last_offer
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Announce ourselves: `join` then `hello`.
    pub async fn join(&mut self) {
        log::info!(
            target: "tandem::signal",
            "join room {} clientId {}",
            self.room,
            self.local_id
        );
        self.send(SignalMessage::Join {
            room_id: self.room.clone(),
            client_id: self.local_id,
        })
        .await;
        self.send_hello().await;
    }

    /// Ensure one `sendrecv` audio transceiver and attach the microphone.
    pub fn attach_microphone(&mut self, stream: LocalStream) {
        if self.closed {
            return;
        }
        let direction = self.ensure_audio_transceiver();
        match self.pc.add_track(&stream.track, &stream.id) {
            Ok(()) => log::info!(
                target: "tandem::track",
                "attached local audio track, transceiver dir: {direction:?}"
            ),
            Err(e) => log::error!(target: "tandem::track", "addTrack failed: {e}"),
        }
        self.local_stream = Some(stream);
    }

    fn ensure_audio_transceiver(&self) -> Option<TransceiverDirection> {
        let existing = self
            .pc
            .transceivers()
            .into_iter()
            .find(|t| t.kind == MediaKind::Audio);
        if let Some(t) = existing {
            if t.direction != TransceiverDirection::SendRecv {
                if let Err(e) = self
                    .pc
                    .set_transceiver_direction(t.id, TransceiverDirection::SendRecv)
                {
                    log::error!(target: "tandem::track", "upgrading transceiver failed: {e}");
                    return Some(t.direction);
                }
            }
            return Some(TransceiverDirection::SendRecv);
        }
        match self
            .pc
            .add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv)
        {
            Ok(t) => {
                log::info!(target: "tandem::track", "created audio transceiver sendrecv");
                Some(t.direction)
            }
            Err(e) => {
                log::error!(target: "tandem::track", "addTransceiver failed: {e}");
                None
            }
        }
    }

    /// Proactive offer from the impolite side once the peer is known.
    ///
    /// A stale local offer (sent before the peer was listening) is replaced.
    pub async fn start_call(&mut self) {
        match self.pc.signaling_state() {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                log::info!(target: "tandem::pc", "startCall: creating offer proactively");
                self.make_offer().await;
            }
            state => log::info!(target: "tandem::pc", "startCall skipped; signalingState={state}"),
        }
    }

    /// Create, apply and send a local offer.
    pub async fn make_offer(&mut self) {
        if self.closed {
            return;
        }
        self.phase = NegotiationPhase::MakingOffer;
        let result = self.offer_step().await;
        self.settle_phase();
        match result {
            Ok(()) => log::info!(target: "tandem::signal", "sent offer"),
            Err(e) => log::error!(target: "tandem::pc", "making offer failed: {e}"),
        }
    }

    async fn offer_step(&mut self) -> Result<(), crate::error::PeerError> {
        let offer = self.pc.create_offer().await?;
        self.pc.set_local_description(offer).await?;
        let sdp = self
            .pc
            .local_description()
            .ok_or(crate::error::PeerError::Sdp("no local description after offer".into()))?;
        self.send(SignalMessage::Offer {
            room_id: self.room.clone(),
            client_id: self.local_id,
            sdp,
        })
        .await;
        Ok(())
    }

    /// Re-derive the phase from the connection once an async step is over.
    fn settle_phase(&mut self) {
        self.phase = match self.pc.signaling_state() {
            SignalingState::HaveLocalOffer => NegotiationPhase::AwaitingAnswer,
            SignalingState::HaveRemoteOffer => NegotiationPhase::Answering,
            SignalingState::Stable | SignalingState::Closed => NegotiationPhase::Stable,
        };
    }

    fn elect_role(&mut self, remote: ClientId) {
        if self.role.is_some() {
            return;
        }
        let role = Role::elect(self.local_id, remote);
        self.role = Some(role);
        log::info!(
            target: "tandem::signal",
            "role elected: {role} (ourId, peerId) = ({}, {remote})",
            self.local_id
        );
    }

    /// Dispatch one inbound signaling message.
    pub async fn handle_signal(&mut self, msg: SignalMessage) {
        if self.closed || !msg.is_for(&self.room, self.local_id) {
            return;
        }
        let first_contact = self.role.is_none();
        self.elect_role(msg.client_id());

        match msg {
            SignalMessage::Join { client_id, .. } => {
                log::debug!(target: "tandem::signal", "peer {client_id} joined; re-announcing");
                self.send_hello().await;
            }
            SignalMessage::Hello { .. } => {}
            SignalMessage::Offer { sdp, .. } => self.on_offer(sdp).await,
            SignalMessage::Answer { sdp, .. } => self.on_answer(sdp).await,
            SignalMessage::Ice { candidate, .. } => self.on_ice(candidate).await,
        }

        if first_contact && !self.closed {
            self.on_peer_known().await;
        }
    }

    async fn on_peer_known(&mut self) {
        match self.role {
            Some(Role::Impolite) => {
                self.deferred_offer = false;
                self.start_call().await;
            }
            Some(Role::Polite) if self.deferred_offer => {
                self.deferred_offer = false;
                if self.pc.signaling_state() == SignalingState::Stable {
                    self.make_offer().await;
                }
            }
            _ => {}
        }
    }

    async fn on_offer(&mut self, sdp: SessionDescription) {
        let state = self.pc.signaling_state();
        let polite = self.role == Some(Role::Polite);
        log::info!(
            target: "tandem::signal",
            "recv offer; signalingState={state} polite={polite} phase={:?}",
            self.phase
        );
        let collision =
            self.phase == NegotiationPhase::MakingOffer || state != SignalingState::Stable;
        if !polite && collision {
            self.last_offer = OfferDecision::Ignored;
            log::info!(target: "tandem::signal", "ignoring offer (collision)");
            return;
        }
        self.last_offer = OfferDecision::Accepted;

        self.phase = NegotiationPhase::Answering;
        let result = self.answer_step(sdp).await;
        self.settle_phase();
        match result {
            Ok(()) => log::info!(target: "tandem::signal", "sent answer"),
            Err(e) => log::error!(target: "tandem::pc", "error handling offer: {e}"),
        }
    }

    async fn answer_step(&mut self, offer: SessionDescription) -> Result<(), crate::error::PeerError> {
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer().await?;
        self.pc.set_local_description(answer).await?;
        let sdp = self
            .pc
            .local_description()
            .ok_or(crate::error::PeerError::Sdp("no local description after answer".into()))?;
        self.send(SignalMessage::Answer {
            room_id: self.room.clone(),
            client_id: self.local_id,
            sdp,
        })
        .await;
        Ok(())
    }

    async fn on_answer(&mut self, sdp: SessionDescription) {
        log::info!(
            target: "tandem::signal",
            "recv answer; signalingState={}",
            self.pc.signaling_state()
        );
        if let Err(e) = self.pc.set_remote_description(sdp).await {
            log::error!(target: "tandem::pc", "error handling answer: {e}");
        }
        self.settle_phase();
    }

    async fn on_ice(&mut self, candidate: IceCandidate) {
        match self.pc.add_ice_candidate(candidate).await {
            Ok(()) => log::debug!(target: "tandem::ice", "added remote ICE"),
            Err(e) if self.last_offer == OfferDecision::Ignored => {
                log::debug!(target: "tandem::ice", "suppressed ICE error after ignored offer: {e}")
            }
            Err(e) => log::error!(target: "tandem::ice", "error adding ICE: {e}"),
        }
    }

    /// Dispatch one event raised by the peer connection.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.closed {
            return;
        }
        match event {
            PeerEvent::NegotiationNeeded => {
                log::info!(target: "tandem::pc", "negotiation needed (phase {:?})", self.phase);
                if self.role.is_none() {
                    log::debug!(target: "tandem::pc", "no peer yet; deferring offer");
                    self.deferred_offer = true;
                } else {
                    self.make_offer().await;
                }
            }
            PeerEvent::LocalCandidate(Some(candidate)) => {
                self.send(SignalMessage::Ice {
                    room_id: self.room.clone(),
                    client_id: self.local_id,
                    candidate,
                })
                .await;
                log::debug!(target: "tandem::ice", "sent ICE candidate");
            }
            PeerEvent::LocalCandidate(None) => {
                log::debug!(target: "tandem::ice", "ICE gathering complete");
            }
            PeerEvent::Track(track) => {
                log::info!(
                    target: "tandem::track",
                    "ontrack: {:?} stream {}",
                    track.kind,
                    track.stream_id
                );
                if track.kind == MediaKind::Audio {
                    let factory = &self.playback_factory;
                    let sink = self.playback.get_or_insert_with(|| factory());
                    sink.bind(&track);
                }
            }
            PeerEvent::ConnectionStateChanged(state) => {
                log::info!(target: "tandem::pc", "connectionState -> {state:?}");
            }
        }
    }

    /// Run the dispatch loop until `shutdown` fires, then clean up.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let Some(mut signals) = self.signaling.take_receiver() else {
            log::error!(target: "tandem::signal", "signaling receiver already taken");
            self.close().await;
            return;
        };
        let Some(mut events) = self.pc.take_events() else {
            log::error!(target: "tandem::pc", "peer events already taken");
            self.close().await;
            return;
        };

        self.join().await;

        let mut signals_open = true;
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                msg = signals.recv(), if signals_open => match msg {
                    Some(msg) => self.handle_signal(msg).await,
                    None => {
                        log::info!(target: "tandem::signal", "WS closed");
                        signals_open = false;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => events_open = false,
                },
                else => break,
            }
        }

        self.close().await;
    }

    /// Stop local tracks, detach senders, close the connection, release
    /// playback and close signaling. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        log::info!(target: "tandem::pc", "cleanup()");
        if let Some(stream) = self.local_stream.take() {
            stream.track.stop();
        }
        self.pc.detach_senders();
        self.pc.close();
        if let Some(mut sink) = self.playback.take() {
            sink.release();
        }
        self.signaling.close().await;
    }

    async fn send_hello(&mut self) {
        self.send(SignalMessage::Hello {
            room_id: self.room.clone(),
            client_id: self.local_id,
        })
        .await;
    }

    async fn send(&self, msg: SignalMessage) {
        if let Err(e) = self.signaling.send(&msg).await {
            log::error!(target: "tandem::signal", "send {} failed: {e}", msg.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMedia, SyntheticMicrophone};
    use crate::peer::MemoryPeerConnection;
    use crate::signaling::{MemorySignalHub, SignalingChannel};
    use uuid::Uuid;

    fn ids() -> (ClientId, ClientId) {
        let low = ClientId::from_uuid(Uuid::from_u128(1));
        let high = ClientId::from_uuid(Uuid::from_u128(2));
        (low, high)
    }

    fn negotiator(hub: &MemorySignalHub, id: ClientId) -> (PerfectNegotiator, Arc<MemoryPeerConnection>) {
        let pc = MemoryPeerConnection::new();
        let channel = hub.connect();
        let n = PerfectNegotiator::new(
            RoomId::new("r1"),
            id,
            pc.clone(),
            channel,
            RecordingPlayback::new().factory(),
        );
        (n, pc)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_future_is_spawnable_with_bound_playback() {
        let hub = MemorySignalHub::new();
        let (low, _) = ids();
        let (mut n, _pc) = negotiator(&hub, low);
        n.playback = Some((n.playback_factory)());

        let (stop, stopped) = oneshot::channel();
        let run = n.run(stopped);
        assert_send(&run);
        let task = tokio::spawn(run);
        let _ = stop.send(());
        task.await.unwrap();
    }

    #[test]
    fn test_role_elect_is_antisymmetric() {
        let (low, high) = ids();
        assert_eq!(Role::elect(low, high), Role::Impolite);
        assert_eq!(Role::elect(high, low), Role::Polite);
    }

    #[tokio::test]
    async fn test_role_elected_once_from_first_message() {
        let hub = MemorySignalHub::new();
        let (low, high) = ids();
        let (mut n, _pc) = negotiator(&hub, high);

        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: low,
        })
        .await;
        assert_eq!(n.role(), Some(Role::Polite));

        // A later hello from a larger id does not re-elect.
        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: ClientId::from_uuid(Uuid::from_u128(u128::MAX)),
        })
        .await;
        assert_eq!(n.role(), Some(Role::Polite));
    }

    #[tokio::test]
    async fn test_foreign_room_and_self_ignored() {
        let hub = MemorySignalHub::new();
        let (low, high) = ids();
        let (mut n, _pc) = negotiator(&hub, high);

        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r2"),
            client_id: low,
        })
        .await;
        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: high,
        })
        .await;
        assert_eq!(n.role(), None);
    }

    #[tokio::test]
    async fn test_impolite_ignores_colliding_offer() {
        let hub = MemorySignalHub::new();
        let (low, high) = ids();
        let (mut n, pc) = negotiator(&hub, low);
        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: high,
        })
        .await;
        // Impolite: electing started a call.
        assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(n.phase(), NegotiationPhase::AwaitingAnswer);

        n.handle_signal(SignalMessage::Offer {
            room_id: RoomId::new("r1"),
            client_id: high,
            sdp: SessionDescription::offer("v=0\r\n"),
        })
        .await;
        assert_eq!(n.last_offer(), OfferDecision::Ignored);
        assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);

        // ICE for the ignored offer fails quietly.
        n.handle_signal(SignalMessage::Ice {
            room_id: RoomId::new("r1"),
            client_id: high,
            candidate: IceCandidate {
                candidate: "candidate:x".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        })
        .await;
        assert!(pc.remote_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_polite_rolls_back_and_answers() {
        let hub = MemorySignalHub::new();
        let (low, high) = ids();
        let (mut n, pc) = negotiator(&hub, high);
        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: low,
        })
        .await;
        n.make_offer().await;
        assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);

        n.handle_signal(SignalMessage::Offer {
            room_id: RoomId::new("r1"),
            client_id: low,
            sdp: SessionDescription::offer("v=0\r\n"),
        })
        .await;
        assert_eq!(n.last_offer(), OfferDecision::Accepted);
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(n.phase(), NegotiationPhase::Stable);
        assert_eq!(hub.count("answer"), 1);
    }

    #[tokio::test]
    async fn test_failed_offer_restores_phase() {
        let hub = MemorySignalHub::new();
        let (low, high) = ids();
        let (mut n, pc) = negotiator(&hub, high);
        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: low,
        })
        .await;

        pc.fail_next(crate::peer::FailOp::SetLocal);
        n.make_offer().await;
        assert_eq!(n.phase(), NegotiationPhase::Stable);
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(hub.count("offer"), 0);

        // Next trigger retries.
        n.make_offer().await;
        assert_eq!(hub.count("offer"), 1);
    }

    #[tokio::test]
    async fn test_negotiation_deferred_until_peer_known() {
        let hub = MemorySignalHub::new();
        let (low, high) = ids();
        let (mut n, pc) = negotiator(&hub, high);
        n.handle_peer_event(PeerEvent::NegotiationNeeded).await;
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(hub.count("offer"), 0);

        // Polite side offers its deferred negotiation once the peer shows up.
        n.handle_signal(SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: low,
        })
        .await;
        assert_eq!(hub.count("offer"), 1);
    }

    #[tokio::test]
    async fn test_transceiver_reused_and_upgraded() {
        let hub = MemorySignalHub::new();
        let (_, high) = ids();
        let (mut n, pc) = negotiator(&hub, high);
        pc.add_transceiver(MediaKind::Audio, TransceiverDirection::RecvOnly)
            .unwrap();

        let media = LocalMedia::acquire(&SyntheticMicrophone::new()).await;
        n.attach_microphone(media.stream().unwrap().clone());

        let transceivers = pc.transceivers();
        assert_eq!(transceivers.len(), 1);
        assert_eq!(transceivers[0].direction, TransceiverDirection::SendRecv);
        assert!(transceivers[0].sender_track.is_some());
    }

    #[tokio::test]
    async fn test_close_stops_track_and_is_idempotent() {
        let hub = MemorySignalHub::new();
        let (_, high) = ids();
        let (mut n, pc) = negotiator(&hub, high);
        let media = LocalMedia::acquire(&SyntheticMicrophone::new()).await;
        n.attach_microphone(media.stream().unwrap().clone());

        n.close().await;
        n.close().await;
        assert!(pc.is_closed());
        assert!(pc.transceivers().iter().all(|t| t.sender_track.is_none()));
        assert_eq!(
            media.track().unwrap().ready_state(),
            crate::media::ReadyState::Ended
        );

        // Handlers are inert after close.
        n.handle_peer_event(PeerEvent::NegotiationNeeded).await;
        assert_eq!(hub.count("offer"), 0);
    }

    #[tokio::test]
    async fn test_first_remote_track_creates_playback() {
        let hub = MemorySignalHub::new();
        let (_, high) = ids();
        let pc = MemoryPeerConnection::new();
        let playback = RecordingPlayback::new();
        let mut n = PerfectNegotiator::new(
            RoomId::new("r1"),
            high,
            pc,
            hub.connect(),
            playback.factory(),
        );
        let track = RemoteTrack {
            id: "t1".into(),
            kind: MediaKind::Audio,
            stream_id: "s1".into(),
        };
        n.handle_peer_event(PeerEvent::Track(track.clone())).await;
        n.handle_peer_event(PeerEvent::Track(track)).await;
        assert_eq!(playback.created(), 1);
        assert_eq!(playback.bound_streams(), vec!["s1", "s1"]);

        n.close().await;
        assert!(playback.released());
    }

    #[tokio::test]
    async fn test_signaling_closed_after_close() {
        let hub = MemorySignalHub::new();
        let (_, high) = ids();
        let pc = MemoryPeerConnection::new();
        let channel = hub.connect();
        let mut n = PerfectNegotiator::new(
            RoomId::new("r1"),
            high,
            pc,
            channel.clone(),
            RecordingPlayback::new().factory(),
        );
        n.close().await;
        let hello = SignalMessage::Hello {
            room_id: RoomId::new("r1"),
            client_id: high,
        };
        assert!(channel.send(&hello).await.is_err());
    }
}
