//! Frame transports between the two participants of a room.
//!
//! The document channel only needs "send bytes to the other peer" and
//! "receive bytes from the other peer"; [`FrameTransport`] is that contract.
//! Two implementations ship:
//!
//! - [`MemoryFrameTransport`]: an in-process duplex pair
//! - [`RelayFrameTransport`]: binary frames through the relay server,
//!   topic `doc-{room}`
//!
//! The relay plumbing ([`RelayLink`]) is shared with the WebSocket
//! signaling channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SignalError;
use crate::protocol::RoomId;

/// Buffered frames per direction before senders wait.
const CHANNEL_CAPACITY: usize = 256;

/// Byte-frame transport to the remote participant.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Send one frame to the remote side.
    async fn send(&self, frame: Vec<u8>) -> Result<(), SignalError>;

    /// Take the inbound frame stream (can only be taken once).
    fn take_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>>;

    /// Close the transport; the remote receiver ends.
    async fn close(&self);
}

// ───────────────────────────────────────────────────────────────────
// In-process duplex
// ───────────────────────────────────────────────────────────────────

/// One end of an in-process duplex frame pipe.
pub struct MemoryFrameTransport {
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    incoming: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl MemoryFrameTransport {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                outgoing: Mutex::new(Some(a_tx)),
                incoming: Mutex::new(Some(b_rx)),
            },
            Self {
                outgoing: Mutex::new(Some(b_tx)),
                incoming: Mutex::new(Some(a_rx)),
            },
        )
    }
}

#[async_trait]
impl FrameTransport for MemoryFrameTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), SignalError> {
        let tx = self.outgoing.lock().clone().ok_or(SignalError::Closed)?;
        tx.send(frame).await.map_err(|_| SignalError::Closed)
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.incoming.lock().take()
    }

    async fn close(&self) {
        self.outgoing.lock().take();
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay plumbing
// ───────────────────────────────────────────────────────────────────

/// An open WebSocket to one relay topic, split into channels.
pub(crate) struct RelayLink {
    pub outgoing: mpsc::Sender<Message>,
    pub incoming: mpsc::Receiver<Message>,
}

/// Relay URL of a topic.
pub(crate) fn topic_url(relay_url: &str, topic: &str) -> String {
    format!("{}/{}", relay_url.trim_end_matches('/'), topic)
}

/// Connect to a relay topic and spawn the reader/writer tasks.
pub(crate) async fn open_relay(url: &str) -> Result<RelayLink, SignalError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SignalError::Transport(e.to_string()))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

    // Writer task: forward outgoing channel to the socket
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_writer.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Reader task: data frames only; tungstenite answers pings itself
    let url_owned = url.to_string();
    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    if in_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    log::debug!("relay link {url_owned} read error: {e}");
                    break;
                }
                Ok(_) => {}
            }
        }
        log::debug!("relay link {url_owned} closed");
    });

    Ok(RelayLink {
        outgoing: out_tx,
        incoming: in_rx,
    })
}

// ───────────────────────────────────────────────────────────────────
// Relay-backed document transport
// ───────────────────────────────────────────────────────────────────

/// Document frames through the relay's `doc-{room}` topic.
pub struct RelayFrameTransport {
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    incoming: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl RelayFrameTransport {
    pub async fn connect(relay_url: &str, room: &RoomId) -> Result<Arc<Self>, SignalError> {
        let url = topic_url(relay_url, &format!("doc-{room}"));
        let mut link = open_relay(&url).await?;

        let (frame_tx, frame_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(msg) = link.incoming.recv().await {
                if let Message::Binary(data) = msg {
                    if frame_tx.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            outgoing: Mutex::new(Some(link.outgoing)),
            incoming: Mutex::new(Some(frame_rx)),
        }))
    }
}

#[async_trait]
impl FrameTransport for RelayFrameTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), SignalError> {
        let tx = self.outgoing.lock().clone().ok_or(SignalError::Closed)?;
        tx.send(Message::Binary(frame.into()))
            .await
            .map_err(|_| SignalError::Closed)
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.incoming.lock().take()
    }

    async fn close(&self) {
        self.outgoing.lock().take();
    }
}
