//! The application socket and the external collaboration service.
//!
//! [`AppSocket`] is an open connection split into an outgoing sender and an
//! inbound stream; the stream ending is how a close is observed. Closing
//! from our side is dropping the socket.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{ServiceError, SessionError};
use crate::protocol::{AppMessage, RoomId};
use crate::transport::{open_relay, topic_url};

const SOCKET_CAPACITY: usize = 64;

/// An open application socket.
pub struct AppSocket {
    outgoing: mpsc::Sender<AppMessage>,
    incoming: mpsc::Receiver<AppMessage>,
}

impl AppSocket {
    pub fn new(outgoing: mpsc::Sender<AppMessage>, incoming: mpsc::Receiver<AppMessage>) -> Self {
        Self { outgoing, incoming }
    }

    pub async fn send(&self, msg: AppMessage) -> Result<(), SessionError> {
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| SessionError::SocketClosed)
    }

    /// Next inbound message; `None` once the socket closed.
    pub async fn recv(&mut self) -> Option<AppMessage> {
        self.incoming.recv().await
    }

    pub fn close(self) {
        drop(self);
    }
}

/// Opens application sockets for a room.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(&self, room: &RoomId, user_id: &str) -> Result<AppSocket, SessionError>;
}

/// Initial state handed out when a room is first entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub problem_title: String,
    pub problem_description: String,
    /// Starting code for the shared editor
    pub template: String,
    pub partner_name: String,
}

/// External collaboration service.
#[async_trait]
pub trait CollabService: Send + Sync {
    async fn connect(&self, room: &RoomId) -> Result<ConnectPayload, ServiceError>;
    async fn reconnect(&self) -> Result<(), ServiceError>;
    async fn terminate(&self, room: &RoomId, final_code: &str) -> Result<(), ServiceError>;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket connector
// ───────────────────────────────────────────────────────────────────

/// Application socket over WebSocket, JSON text frames, `{base}/{room}`.
pub struct WsSocketConnector {
    base_url: String,
}

impl WsSocketConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

/// `{base}/{room}?user_id=...` with the user id query-encoded.
pub fn app_socket_url(base_url: &str, room: &RoomId, user_id: &str) -> Result<String, SessionError> {
    let raw = topic_url(base_url, room.as_str());
    let mut url =
        Url::parse(&raw).map_err(|e| SessionError::Socket(format!("invalid socket url {raw}: {e}")))?;
    url.query_pairs_mut().append_pair("user_id", user_id);
    Ok(url.to_string())
}

#[async_trait]
impl SocketConnector for WsSocketConnector {
    async fn open(&self, room: &RoomId, user_id: &str) -> Result<AppSocket, SessionError> {
        let url = app_socket_url(&self.base_url, room, user_id)?;
        let link = open_relay(&url)
            .await
            .map_err(|e| SessionError::Socket(e.to_string()))?;
        let ws_out = link.outgoing;
        let mut ws_in = link.incoming;

        let (out_tx, mut out_rx) = mpsc::channel::<AppMessage>(SOCKET_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<AppMessage>(SOCKET_CAPACITY);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match msg.encode() {
                    Ok(raw) => {
                        if ws_out.send(Message::Text(raw.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!(target: "tandem::session", "encoding app message: {e}"),
                }
            }
        });
        tokio::spawn(async move {
            while let Some(msg) = ws_in.recv().await {
                let Message::Text(text) = msg else { continue };
                match AppMessage::decode(text.as_str()) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!(target: "tandem::session", "dropping app message: {e}"),
                }
            }
        });

        Ok(AppSocket::new(out_tx, in_rx))
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory connector
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ConnectorState {
    failures_remaining: usize,
    opens: usize,
    failed_opens: usize,
    sent: Vec<AppMessage>,
    to_client: Option<mpsc::Sender<AppMessage>>,
    connected: bool,
}

/// In-process connector with a server-side control handle.
#[derive(Clone, Default)]
pub struct MemorySocketConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MemorySocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.state.lock().failures_remaining = n;
    }

    /// Drop the current connection from the server side.
    pub fn drop_connection(&self) {
        let mut state = self.state.lock();
        state.to_client = None;
        state.connected = false;
    }

    /// Push a message to the connected client.
    pub fn push(&self, msg: AppMessage) -> bool {
        let tx = self.state.lock().to_client.clone();
        match tx {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Successful opens so far.
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn failed_opens(&self) -> usize {
        self.state.lock().failed_opens
    }

    /// Every message the client sent, across connections.
    pub fn sent(&self) -> Vec<AppMessage> {
        self.state.lock().sent.clone()
    }

    pub fn count_sent(&self, kind: &crate::protocol::AppMessageKind) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|m| &m.message == kind)
            .count()
    }
}

#[async_trait]
impl SocketConnector for MemorySocketConnector {
    async fn open(&self, room: &RoomId, _user_id: &str) -> Result<AppSocket, SessionError> {
        let (out_tx, mut out_rx) = mpsc::channel::<AppMessage>(SOCKET_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<AppMessage>(SOCKET_CAPACITY);
        {
            let mut state = self.state.lock();
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                state.failed_opens += 1;
                return Err(SessionError::Socket(format!("connection to {room} refused")));
            }
            state.opens += 1;
            state.to_client = Some(in_tx);
            state.connected = true;
        }

        let state = self.state.clone();
        let generation = state.lock().opens;
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                state.lock().sent.push(msg);
            }
            // Client closed; only mark the latest connection.
            let mut state = state.lock();
            if state.opens == generation {
                state.connected = false;
                state.to_client = None;
            }
        });
        Ok(AppSocket::new(out_tx, in_rx))
    }
}

// ───────────────────────────────────────────────────────────────────
// Scripted collaboration service
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ServiceState {
    connects: usize,
    reconnects: usize,
    terminations: Vec<(RoomId, String)>,
    reconnect_failures: VecDeque<ServiceError>,
}

/// Collaboration service answering from memory.
#[derive(Clone)]
pub struct MemoryCollabService {
    payload: ConnectPayload,
    state: Arc<Mutex<ServiceState>>,
}

impl MemoryCollabService {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            payload: ConnectPayload {
                problem_title: "Two Sum".to_string(),
                problem_description: "Return indices of the two numbers adding up to target."
                    .to_string(),
                template: template.into(),
                partner_name: "Your Partner".to_string(),
            },
            state: Arc::new(Mutex::new(ServiceState::default())),
        }
    }

    /// Make the next reconnect acknowledgement fail.
    pub fn fail_next_reconnect(&self, err: ServiceError) {
        self.state.lock().reconnect_failures.push_back(err);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().reconnects
    }

    pub fn terminations(&self) -> Vec<(RoomId, String)> {
        self.state.lock().terminations.clone()
    }
}

#[async_trait]
impl CollabService for MemoryCollabService {
    async fn connect(&self, _room: &RoomId) -> Result<ConnectPayload, ServiceError> {
        self.state.lock().connects += 1;
        Ok(self.payload.clone())
    }

    async fn reconnect(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock();
        if let Some(err) = state.reconnect_failures.pop_front() {
            return Err(err);
        }
        state.reconnects += 1;
        Ok(())
    }

    async fn terminate(&self, room: &RoomId, final_code: &str) -> Result<(), ServiceError> {
        self.state
            .lock()
            .terminations
            .push((room.clone(), final_code.to_string()));
        Ok(())
    }
}
