//! Signaling channel: the message transport used only to set up audio.
//!
//! Contract: `send(message)`, a single inbound stream (the `onMessage`
//! handler), and `close`. There is no delivery guarantee beyond the
//! underlying transport and no reconnection here; the session lifecycle
//! owns recovery.
//!
//! Room scoping happens at the receiver: [`SignalMessage::is_for`] drops
//! foreign-room and self-sent messages before the negotiator sees them.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use crate::error::SignalError;
use crate::protocol::{RoomId, SignalMessage};
use crate::transport::{open_relay, topic_url};

/// Inbound messages buffered per channel.
const INBOUND_CAPACITY: usize = 256;

/// A room-scoped signaling transport.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, msg: &SignalMessage) -> Result<(), SignalError>;

    /// Take the inbound message stream (can only be called once).
    fn take_receiver(&self) -> Option<mpsc::Receiver<SignalMessage>>;

    async fn close(&self);
}

// ───────────────────────────────────────────────────────────────────
// In-process hub
// ───────────────────────────────────────────────────────────────────

/// In-process signaling fan-out.
///
/// Every channel connected to the hub sees every message sent by any
/// channel, including its own, just like a naive broadcast relay; the
/// receiving negotiator is responsible for self-echo suppression.
#[derive(Clone)]
pub struct MemorySignalHub {
    sender: broadcast::Sender<SignalMessage>,
    history: Arc<Mutex<Vec<SignalMessage>>>,
}

impl MemorySignalHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            sender,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Connect a new channel. Must be called inside a tokio runtime.
    pub fn connect(&self) -> Arc<MemorySignalChannel> {
        let mut sub = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let forward = tokio::spawn(async move {
            loop {
                match sub.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!(target: "tandem::signal", "memory channel lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Arc::new(MemorySignalChannel {
            hub: self.clone(),
            receiver: Mutex::new(Some(rx)),
            forward: Mutex::new(Some(forward)),
        })
    }

    /// Every message sent through the hub so far.
    pub fn history(&self) -> Vec<SignalMessage> {
        self.history.lock().clone()
    }

    /// Number of sent messages of the given kind (`"offer"`, `"ice"`, ...).
    pub fn count(&self, kind: &str) -> usize {
        self.history.lock().iter().filter(|m| m.kind() == kind).count()
    }
}

impl Default for MemorySignalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel attached to a [`MemorySignalHub`].
pub struct MemorySignalChannel {
    hub: MemorySignalHub,
    receiver: Mutex<Option<mpsc::Receiver<SignalMessage>>>,
    forward: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl SignalingChannel for MemorySignalChannel {
    async fn send(&self, msg: &SignalMessage) -> Result<(), SignalError> {
        if self.forward.lock().is_none() {
            return Err(SignalError::Closed);
        }
        self.hub.history.lock().push(msg.clone());
        // No subscribers is not an error: the peer may not have joined yet.
        let _ = self.hub.sender.send(msg.clone());
        Ok(())
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<SignalMessage>> {
        self.receiver.lock().take()
    }

    async fn close(&self) {
        if let Some(task) = self.forward.lock().take() {
            task.abort();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket (relay) channel
// ───────────────────────────────────────────────────────────────────

/// Signaling over the relay's `signal-{room}` topic as JSON text frames.
pub struct WsSignalingChannel {
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    receiver: Mutex<Option<mpsc::Receiver<SignalMessage>>>,
}

impl WsSignalingChannel {
    pub async fn connect(relay_url: &str, room: &RoomId) -> Result<Arc<Self>, SignalError> {
        let url = topic_url(relay_url, &format!("signal-{room}"));
        let mut link = open_relay(&url).await?;
        log::info!(target: "tandem::signal", "WS open on {url}");

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = link.incoming.recv().await {
                let Message::Text(text) = msg else { continue };
                match SignalMessage::decode(text.as_str()) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!(target: "tandem::signal", "dropping unparsable frame: {e}"),
                }
            }
            log::info!(target: "tandem::signal", "WS closed");
        });

        Ok(Arc::new(Self {
            outgoing: Mutex::new(Some(link.outgoing)),
            receiver: Mutex::new(Some(rx)),
        }))
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&self, msg: &SignalMessage) -> Result<(), SignalError> {
        let raw = msg.encode()?;
        let tx = self.outgoing.lock().clone().ok_or(SignalError::Closed)?;
        tx.send(Message::Text(raw.into()))
            .await
            .map_err(|_| SignalError::Closed)
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<SignalMessage>> {
        self.receiver.lock().take()
    }

    async fn close(&self) {
        self.outgoing.lock().take();
    }
}
