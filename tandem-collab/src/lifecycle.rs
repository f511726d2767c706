//! Session lifecycle: the top-level state machine of a room.
//!
//! ```text
//!   Idle ──► Connecting ──► Connected ◄──────────────┐
//!                │              │ socket close       │ open + ack
//!                │ failure      ▼                    │
//!                │          Reconnecting ── delay ───┘
//!                │              │ attempts exhausted
//!                ▼              ▼
//!            Terminated ◄── user exit / partner termination
//! ```
//!
//! The lifecycle owns the application socket, the single active timer
//! (heartbeat while connected, reconnect delay while reconnecting, never
//! both) and the reconnect counter. Every transition is published as a
//! [`SessionEvent`].

use std::collections::HashMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use crate::cache::CacheEntry;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::matchmaking::ConfirmedMatch;
use crate::protocol::{AppMessage, AppMessageKind, RoomId};
use crate::socket::{AppSocket, CollabService, ConnectPayload, SocketConnector};

/// Notice id of the reconnect status banner.
pub const NOTICE_RECONNECT: &str = "reconnect-status";
pub const NOTICE_RECONNECT_FAILED: &str = "reconnect-failed";
pub const NOTICE_PARTNER_LEFT: &str = "partner-left";
pub const NOTICE_MATCH_TERMINATED: &str = "match-terminated";
pub const NOTICE_CONNECT_FAILED: &str = "connect-failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Terminated,
}

/// Where the user is sent after leaving a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Matchmaking,
    Home,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A user-visible notice. Notices with the same id replace each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: String,
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn new(id: &str, level: NoticeLevel, text: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            level,
            text: text.into(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    UserExit,
    PartnerTerminated,
    ReconnectExhausted,
    ConnectFailed,
    /// The owner dropped the command channel
    Abandoned,
}

/// Everything a session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// First entry into the room succeeded
    Joined(ConnectPayload),
    Reconnecting { attempt: u32, max: u32 },
    Notice(Notice),
    NoticeCleared(String),
    /// A cached editor text from an earlier visit exists
    RecoveryAvailable(CacheEntry),
    Navigate(Destination),
    Terminated(TerminationReason),
}

// ───────────────────────────────────────────────────────────────────
// Notices and counter
// ───────────────────────────────────────────────────────────────────

/// Notices currently shown, keyed by id.
#[derive(Debug, Default)]
pub struct NoticeBoard {
    notices: HashMap<String, Notice>,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notice; returns `true` if it replaced one with the same id.
    pub fn show(&mut self, notice: Notice) -> bool {
        self.notices.insert(notice.id.clone(), notice).is_some()
    }

    pub fn clear(&mut self, id: &str) -> bool {
        self.notices.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Notice> {
        self.notices.get(id)
    }

    pub fn len(&self) -> usize {
        self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }
}

/// Consecutive failed connection attempts, bounded by `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectCounter {
    attempts: u32,
    max: u32,
}

impl ReconnectCounter {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    /// Count one failure. Returns the new count, or `None` when the bound
    /// was already reached.
    pub fn record_failure(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

// ───────────────────────────────────────────────────────────────────
// Room resources
// ───────────────────────────────────────────────────────────────────

/// The parts of a room the lifecycle tears down but does not own.
#[async_trait]
pub trait RoomResources: Send {
    /// Current editor text, sent with a user exit.
    fn final_code(&self) -> String;

    /// Stop local media and close the peer connection and document channel.
    async fn release(&mut self);

    /// Drop the recovery cache entry.
    fn clear_cache(&mut self);
}

/// A room with nothing attached.
pub struct NoResources;

#[async_trait]
impl RoomResources for NoResources {
    fn final_code(&self) -> String {
        String::new()
    }

    async fn release(&mut self) {}

    fn clear_cache(&mut self) {}
}

/// Commands from the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleCommand {
    /// User leaves the room
    Exit,
}

// ───────────────────────────────────────────────────────────────────
// Timers
// ───────────────────────────────────────────────────────────────────

enum Timer {
    None,
    Heartbeat(Interval),
    ReconnectDelay(Pin<Box<Sleep>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerFired {
    Heartbeat,
    ReconnectDelay,
}

impl Timer {
    async fn fired(&mut self) -> TimerFired {
        match self {
            Timer::None => pending().await,
            Timer::Heartbeat(interval) => {
                interval.tick().await;
                TimerFired::Heartbeat
            }
            Timer::ReconnectDelay(sleep) => {
                sleep.as_mut().await;
                TimerFired::ReconnectDelay
            }
        }
    }
}

async fn next_inbound(socket: &mut Option<AppSocket>) -> Option<AppMessage> {
    match socket {
        Some(socket) => socket.recv().await,
        None => pending().await,
    }
}

async fn redirect_due(redirect: &mut Option<Pin<Box<Sleep>>>) {
    match redirect {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

// ───────────────────────────────────────────────────────────────────
// Lifecycle
// ───────────────────────────────────────────────────────────────────

/// Sole owner and mutator of a room's session state.
pub struct SessionLifecycle {
    config: SessionConfig,
    room: RoomId,
    user_id: String,
    connector: Arc<dyn SocketConnector>,
    service: Arc<dyn CollabService>,
    state: SessionState,
    counter: ReconnectCounter,
    socket: Option<AppSocket>,
    timer: Timer,
    redirect: Option<Pin<Box<Sleep>>>,
    notices: NoticeBoard,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionLifecycle {
    pub fn new(
        config: SessionConfig,
        confirmed: &ConfirmedMatch,
        connector: Arc<dyn SocketConnector>,
        service: Arc<dyn CollabService>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let counter = ReconnectCounter::new(config.max_reconnect_attempts);
        Self {
            config,
            room: confirmed.room().clone(),
            user_id: confirmed.user_id().to_string(),
            connector,
            service,
            state: SessionState::Idle,
            counter,
            socket: None,
            timer: Timer::None,
            redirect: None,
            notices: NoticeBoard::new(),
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.counter.attempts()
    }

    pub fn notices(&self) -> &NoticeBoard {
        &self.notices
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::info!(target: "tandem::session", "{:?} -> {state:?}", self.state);
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn show_notice(&mut self, notice: Notice) {
        if self.notices.show(notice.clone()) {
            log::debug!(target: "tandem::session", "notice {} updated", notice.id);
        }
        self.emit(SessionEvent::Notice(notice));
    }

    fn clear_notice(&mut self, id: &str) {
        if self.notices.clear(id) {
            self.emit(SessionEvent::NoticeCleared(id.to_string()));
        }
    }

    fn start_heartbeat(&mut self) {
        let period = self.config.heartbeat_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Timer::Heartbeat(interval);
    }

    /// Idle → Connecting → Connected.
    ///
    /// Opens the socket, announces the first join and fetches the problem
    /// payload. On failure the session terminates and the user is sent
    /// back to matchmaking.
    pub async fn connect(&mut self) -> Result<ConnectPayload, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Terminated);
        }
        self.set_state(SessionState::Connecting);

        match self.open_and_join().await {
            Ok(payload) => {
                self.set_state(SessionState::Connected);
                self.start_heartbeat();
                self.emit(SessionEvent::Joined(payload.clone()));
                Ok(payload)
            }
            Err(e) => {
                log::error!(target: "tandem::session", "connect to {} failed: {e}", self.room);
                self.socket = None;
                self.show_notice(Notice::new(
                    NOTICE_CONNECT_FAILED,
                    NoticeLevel::Error,
                    "Could not join the session.",
                ));
                self.finish(TerminationReason::ConnectFailed, Destination::Matchmaking);
                Err(e)
            }
        }
    }

    async fn open_and_join(&mut self) -> Result<ConnectPayload, SessionError> {
        let socket = self.connector.open(&self.room, &self.user_id).await?;
        socket
            .send(AppMessage::new(&self.user_id, self.room.as_str(), AppMessageKind::Connect))
            .await?;
        self.socket = Some(socket);
        let payload = self.service.connect(&self.room).await?;
        Ok(payload)
    }

    /// Drive the session until it terminates.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<LifecycleCommand>,
        mut resources: Box<dyn RoomResources>,
    ) -> TerminationReason {
        if self.state == SessionState::Terminated {
            resources.release().await;
            return TerminationReason::ConnectFailed;
        }

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let reason = match cmd {
                        Some(LifecycleCommand::Exit) => {
                            self.exit(resources.as_mut()).await;
                            TerminationReason::UserExit
                        }
                        None => {
                            self.teardown(resources.as_mut()).await;
                            self.finish(TerminationReason::Abandoned, Destination::Home);
                            TerminationReason::Abandoned
                        }
                    };
                    return reason;
                }
                inbound = next_inbound(&mut self.socket) => match inbound {
                    Some(msg) => self.on_message(msg),
                    None => {
                        log::warn!(target: "tandem::session", "socket closed");
                        if let Some(reason) = self.on_connection_lost(resources.as_mut()).await {
                            return reason;
                        }
                    }
                },
                fired = self.timer.fired() => match fired {
                    TimerFired::Heartbeat => self.send_heartbeat().await,
                    TimerFired::ReconnectDelay => {
                        self.timer = Timer::None;
                        if let Some(reason) = self.attempt_reconnect(resources.as_mut()).await {
                            return reason;
                        }
                    }
                },
                _ = redirect_due(&mut self.redirect) => {
                    self.redirect = None;
                    self.teardown(resources.as_mut()).await;
                    self.finish(TerminationReason::PartnerTerminated, Destination::Home);
                    return TerminationReason::PartnerTerminated;
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        let Some(socket) = self.socket.as_ref() else { return };
        let msg = AppMessage::heartbeat(&self.user_id, self.room.as_str());
        match socket.send(msg).await {
            Ok(()) => log::trace!(target: "tandem::session", "heartbeat sent"),
            Err(e) => log::warn!(target: "tandem::session", "heartbeat failed: {e}"),
        }
    }

    fn on_message(&mut self, msg: AppMessage) {
        match msg.message {
            AppMessageKind::PartnerLeft => {
                self.show_notice(Notice::new(
                    NOTICE_PARTNER_LEFT,
                    NoticeLevel::Warning,
                    "Your partner has left the session.",
                ));
            }
            AppMessageKind::MatchTerminate => {
                self.show_notice(Notice::new(
                    NOTICE_MATCH_TERMINATED,
                    NoticeLevel::Warning,
                    "Your partner ended the session. Leaving the room shortly.",
                ));
                if self.redirect.is_none() {
                    self.redirect = Some(Box::pin(tokio::time::sleep(
                        self.config.terminate_redirect_delay(),
                    )));
                }
            }
            other => log::debug!(target: "tandem::session", "ignoring app message {other:?}"),
        }
    }

    /// The socket closed or an attempt failed. Returns a reason when the
    /// session is over.
    async fn on_connection_lost(
        &mut self,
        resources: &mut dyn RoomResources,
    ) -> Option<TerminationReason> {
        self.socket = None;
        self.timer = Timer::None;

        match self.counter.record_failure() {
            Some(attempt) => {
                self.set_state(SessionState::Reconnecting);
                self.emit(SessionEvent::Reconnecting {
                    attempt,
                    max: self.counter.max(),
                });
                self.show_notice(Notice::new(
                    NOTICE_RECONNECT,
                    NoticeLevel::Warning,
                    format!(
                        "Connection lost, attempting to reconnect ({attempt}/{})",
                        self.counter.max()
                    ),
                ));
                self.timer = Timer::ReconnectDelay(Box::pin(tokio::time::sleep(
                    self.config.reconnect_delay(),
                )));
                None
            }
            None => {
                log::error!(
                    target: "tandem::session",
                    "giving up after {} reconnect attempts",
                    self.counter.attempts()
                );
                self.clear_notice(NOTICE_RECONNECT);
                self.show_notice(Notice::new(
                    NOTICE_RECONNECT_FAILED,
                    NoticeLevel::Error,
                    "Unable to reconnect. Returning to matchmaking.",
                ));
                self.teardown(resources).await;
                self.finish(TerminationReason::ReconnectExhausted, Destination::Matchmaking);
                Some(TerminationReason::ReconnectExhausted)
            }
        }
    }

    /// Reopen the socket and wait for the service to acknowledge the rejoin
    /// before heartbeats resume.
    async fn attempt_reconnect(
        &mut self,
        resources: &mut dyn RoomResources,
    ) -> Option<TerminationReason> {
        log::info!(
            target: "tandem::session",
            "reconnect attempt {}/{}",
            self.counter.attempts(),
            self.counter.max()
        );
        let socket = match self.connector.open(&self.room, &self.user_id).await {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!(target: "tandem::session", "reconnect failed: {e}");
                return self.on_connection_lost(resources).await;
            }
        };
        if let Err(e) = self.service.reconnect().await {
            log::warn!(target: "tandem::session", "reconnect not acknowledged: {e}");
            socket.close();
            return self.on_connection_lost(resources).await;
        }
        let rejoin = AppMessage::new(&self.user_id, self.room.as_str(), AppMessageKind::Reconnect);
        if let Err(e) = socket.send(rejoin).await {
            log::warn!(target: "tandem::session", "reconnect notice failed: {e}");
            return self.on_connection_lost(resources).await;
        }

        self.counter.reset();
        self.socket = Some(socket);
        self.clear_notice(NOTICE_RECONNECT);
        self.set_state(SessionState::Connected);
        self.start_heartbeat();
        None
    }

    /// Explicit user exit: announce, clear the cache, tear down, leave.
    async fn exit(&mut self, resources: &mut dyn RoomResources) {
        let final_code = resources.final_code();
        if let Err(e) = self.service.terminate(&self.room, &final_code).await {
            log::warn!(target: "tandem::session", "terminate announcement failed: {e}");
        }
        resources.clear_cache();
        self.teardown(resources).await;
        self.finish(TerminationReason::UserExit, Destination::Home);
    }

    /// Leave a room whose setup failed after the first connect succeeded.
    pub async fn abandon_setup(mut self, resources: &mut dyn RoomResources) -> TerminationReason {
        self.show_notice(Notice::new(
            NOTICE_CONNECT_FAILED,
            NoticeLevel::Error,
            "Could not join the session.",
        ));
        self.teardown(resources).await;
        self.finish(TerminationReason::ConnectFailed, Destination::Matchmaking);
        TerminationReason::ConnectFailed
    }

    /// Media and peer first, then the socket, then every timer.
    async fn teardown(&mut self, resources: &mut dyn RoomResources) {
        resources.release().await;
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.timer = Timer::None;
        self.redirect = None;
        log::debug!(target: "tandem::session", "room {} torn down", self.room);
    }

    fn finish(&mut self, reason: TerminationReason, destination: Destination) {
        self.set_state(SessionState::Terminated);
        self.emit(SessionEvent::Terminated(reason));
        self.emit(SessionEvent::Navigate(destination));
    }
}
