//! A collaboration session: everything a confirmed match turns into.
//!
//! ```text
//!                       ConfirmedMatch
//!                             │
//!                             ▼
//!   SessionLifecycle ── connect ──► ConnectPayload (template)
//!        │                                │
//!        │  owns socket + timers          ├──► LocalMedia (muted mic)
//!        │                                ├──► PerfectNegotiator task
//!        │                                ├──► DocumentLink (+ seed)
//!        │                                ├──► speech monitor task
//!        │                                └──► recovery cache mirror task
//!        ▼
//!   RoomResources::release on every way out
//! ```
//!
//! The lifecycle runs on its own task; [`CollabSession`] is the handle the
//! UI side keeps.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::awareness::{AwarenessState, TextCursor};
use crate::cache::{cache_key, RecoveryCache};
use crate::config::SessionConfig;
use crate::doc_link::DocumentLink;
use crate::error::{ReplicationError, SessionError};
use crate::lifecycle::{
    LifecycleCommand, RoomResources, SessionEvent, SessionLifecycle, TerminationReason,
};
use crate::matchmaking::ConfirmedMatch;
use crate::media::{spawn_speech_monitor, LocalMedia, MediaDevices};
use crate::negotiation::{PerfectNegotiator, PlaybackFactory};
use crate::peer::PeerConnection;
use crate::protocol::{ClientId, RoomId};
use crate::replication::{EditorModel, TextEdit};
use crate::signaling::{SignalingChannel, WsSignalingChannel};
use crate::socket::{CollabService, ConnectPayload, SocketConnector};
use crate::transport::{FrameTransport, RelayFrameTransport};

/// The external pieces a session is built from.
pub struct SessionParts {
    pub config: SessionConfig,
    /// Display name carried in awareness records
    pub user_name: String,
    pub connector: Arc<dyn SocketConnector>,
    pub service: Arc<dyn CollabService>,
    pub devices: Arc<dyn MediaDevices>,
    /// A fresh peer connection configured with `config.ice_servers`
    pub peer: Arc<dyn PeerConnection>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub doc_transport: Arc<dyn FrameTransport>,
    pub cache: Arc<dyn RecoveryCache>,
    pub playback: PlaybackFactory,
    pub editor: Box<dyn EditorModel>,
}

/// Signaling channel and document transport of one room on a relay.
pub struct RelayEndpoints {
    pub signaling: Arc<dyn SignalingChannel>,
    pub doc_transport: Arc<dyn FrameTransport>,
}

impl RelayEndpoints {
    /// Join the room's `signal-` and `doc-` topics on `config.relay_url`.
    pub async fn connect(config: &SessionConfig, room: &RoomId) -> Result<Self, SessionError> {
        let signaling = WsSignalingChannel::connect(&config.relay_url, room).await?;
        let doc_transport = RelayFrameTransport::connect(&config.relay_url, room).await?;
        log::info!(target: "tandem::session", "room {room} on relay {}", config.relay_url);
        Ok(Self {
            signaling,
            doc_transport,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Room resources
// ───────────────────────────────────────────────────────────────────

/// Microphone and negotiator: what exists of a room before its document
/// channel opens.
struct VoiceParts {
    media: Arc<LocalMedia>,
    negotiator_shutdown: Option<oneshot::Sender<()>>,
    negotiator: Option<JoinHandle<()>>,
}

impl VoiceParts {
    async fn stop(&mut self) {
        self.media.stop();
        if let Some(shutdown) = self.negotiator_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.negotiator.take() {
            if let Err(e) = task.await {
                log::warn!(target: "tandem::session", "negotiator task ended abnormally: {e}");
            }
        }
    }
}

#[async_trait]
impl RoomResources for VoiceParts {
    fn final_code(&self) -> String {
        String::new()
    }

    async fn release(&mut self) {
        self.stop().await;
    }

    fn clear_cache(&mut self) {}
}

struct RoomParts {
    voice: VoiceParts,
    doc: Arc<DocumentLink>,
    speech_monitor: Option<JoinHandle<()>>,
    cache_mirror: Option<JoinHandle<()>>,
    cache: Arc<dyn RecoveryCache>,
    cache_key: String,
}

impl RoomParts {
    fn stop_cache_mirror(&mut self) {
        if let Some(task) = self.cache_mirror.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl RoomResources for RoomParts {
    fn final_code(&self) -> String {
        self.doc.text()
    }

    async fn release(&mut self) {
        self.stop_cache_mirror();
        if let Some(task) = self.speech_monitor.take() {
            task.abort();
        }
        self.voice.stop().await;

        // Dropping the returned editor releases the model with the room.
        drop(self.doc.close().await);
    }

    fn clear_cache(&mut self) {
        self.stop_cache_mirror();
        if let Err(e) = self.cache.clear(&self.cache_key) {
            log::warn!(target: "tandem::session", "clearing recovery cache failed: {e}");
        }
    }
}

fn spawn_cache_mirror(
    doc: Arc<DocumentLink>,
    cache: Arc<dyn RecoveryCache>,
    key: String,
    config: &SessionConfig,
) -> JoinHandle<()> {
    let period = config.cache_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if doc.is_closed() {
                break;
            }
            if let Err(e) = cache.store(&key, &doc.text()) {
                log::warn!(target: "tandem::session", "recovery cache write failed: {e}");
            }
        }
    })
}

// ───────────────────────────────────────────────────────────────────
// Session handle
// ───────────────────────────────────────────────────────────────────

/// A live room.
pub struct CollabSession {
    room: RoomId,
    local_id: ClientId,
    payload: ConnectPayload,
    media: Arc<LocalMedia>,
    doc: Arc<DocumentLink>,
    speaking: watch::Receiver<bool>,
    commands: mpsc::Sender<LifecycleCommand>,
    lifecycle: JoinHandle<TerminationReason>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl CollabSession {
    /// Enter the room of a confirmed match.
    ///
    /// Fails only if the first connection cannot be established; every
    /// later failure is reported through [`SessionEvent`]s.
    pub async fn start(confirmed: ConfirmedMatch, parts: SessionParts) -> Result<Self, SessionError> {
        let SessionParts {
            config,
            user_name,
            connector,
            service,
            devices,
            peer,
            signaling,
            doc_transport,
            cache,
            playback,
            editor,
        } = parts;
        let room = confirmed.room().clone();
        let key = cache_key(&room, confirmed.user_id());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        match cache.load(&key) {
            Ok(Some(entry)) => {
                log::info!(target: "tandem::session", "recovery text available for {room}");
                let _ = event_tx.send(SessionEvent::RecoveryAvailable(entry));
            }
            Ok(None) => {}
            Err(e) => log::warn!(target: "tandem::session", "recovery cache unreadable: {e}"),
        }

        let mut lifecycle =
            SessionLifecycle::new(config.clone(), &confirmed, connector, service, event_tx);
        let payload = lifecycle.connect().await?;

        let media = Arc::new(LocalMedia::acquire(devices.as_ref()).await);
        let local_id = ClientId::random();
        log::info!(
            target: "tandem::session",
            "room {room} as {local_id}, ice servers {:?}",
            config.ice_servers
        );

        let mut negotiator = PerfectNegotiator::new(room.clone(), local_id, peer, signaling, playback);
        if let Some(stream) = media.stream() {
            negotiator.attach_microphone(stream.clone());
        }
        let (negotiator_shutdown, shutdown_rx) = oneshot::channel();
        let mut voice = VoiceParts {
            media: media.clone(),
            negotiator_shutdown: Some(negotiator_shutdown),
            negotiator: Some(tokio::spawn(negotiator.run(shutdown_rx))),
        };

        let doc = match DocumentLink::open(local_id, &user_name, editor, doc_transport).await {
            Ok(doc) => Arc::new(doc),
            Err(e) => {
                log::error!(target: "tandem::session", "document channel for {room} failed: {e}");
                lifecycle.abandon_setup(&mut voice).await;
                return Err(e.into());
            }
        };
        if let Err(e) = doc.seed_if_empty(&payload.template).await {
            log::warn!(target: "tandem::doc", "seeding template failed: {e}");
        }

        let (speaking_tx, speaking) = watch::channel(false);
        let speech_monitor = media
            .stream()
            .map(|stream| spawn_speech_monitor(stream, &config, speaking_tx));
        let cache_mirror = spawn_cache_mirror(doc.clone(), cache.clone(), key.clone(), &config);

        let resources = RoomParts {
            voice,
            doc: doc.clone(),
            speech_monitor,
            cache_mirror: Some(cache_mirror),
            cache,
            cache_key: key,
        };
        let (commands, command_rx) = mpsc::channel(8);
        let lifecycle = tokio::spawn(lifecycle.run(command_rx, Box::new(resources)));

        Ok(Self {
            room,
            local_id,
            payload,
            media,
            doc,
            speaking,
            commands,
            lifecycle,
            events: Some(event_rx),
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// Problem and partner details handed out on entry.
    pub fn payload(&self) -> &ConnectPayload {
        &self.payload
    }

    /// Take the session event stream (can only be taken once).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    pub async fn edit(&self, edit: TextEdit) -> Result<(), ReplicationError> {
        self.doc.edit(edit).await
    }

    pub async fn set_cursor(&self, cursor: Option<TextCursor>) {
        self.doc.set_cursor(cursor).await
    }

    pub fn text(&self) -> String {
        self.doc.text()
    }

    pub fn awareness(&self) -> Vec<AwarenessState> {
        self.doc.awareness()
    }

    /// Text revision watch, bumped on every local or remote change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.doc.subscribe()
    }

    pub fn voice_available(&self) -> bool {
        self.media.is_available()
    }

    pub fn is_muted(&self) -> bool {
        self.media.is_muted()
    }

    /// Flip the microphone; returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        self.media.toggle_mute()
    }

    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    /// Leave the room and wait for the teardown to finish.
    pub async fn exit(self) -> TerminationReason {
        if self.commands.send(LifecycleCommand::Exit).await.is_err() {
            log::debug!(target: "tandem::session", "session already over");
        }
        self.finished().await
    }

    /// Wait for the session to end by any path.
    pub async fn finished(self) -> TerminationReason {
        match self.lifecycle.await {
            Ok(reason) => reason,
            Err(e) => {
                log::error!(target: "tandem::session", "lifecycle task failed: {e}");
                TerminationReason::Abandoned
            }
        }
    }
}
