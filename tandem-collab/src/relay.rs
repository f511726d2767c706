//! Topic-scoped WebSocket relay.
//!
//! ```text
//!  ws://relay/signal-r1 ──┐                 ┌──► other members of signal-r1
//!                         ├── TopicGroup ───┤
//!  ws://relay/signal-r1 ──┘  (broadcast)    └──► (never back to the sender)
//!
//!  ws://relay/doc-r1    ──── TopicGroup ───► ...
//! ```
//!
//! The relay does not look inside frames. Text frames (signaling and
//! application messages) and binary frames (document channel) are fanned
//! out unchanged to every other connection on the same URL path. A topic
//! is dropped when its last member leaves.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::error::RelayError;

/// A frame in flight, tagged with the connection it came from.
#[derive(Debug)]
pub struct RelayFrame {
    pub from: u64,
    pub message: Message,
}

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub active_topics: usize,
    pub frames_relayed: u64,
    /// Frames a lagging member never received
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    frames_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

// ───────────────────────────────────────────────────────────────────
// Topic groups
// ───────────────────────────────────────────────────────────────────

/// Fan-out group of one topic.
pub struct TopicGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    members: RwLock<HashSet<u64>>,
}

impl TopicGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
        }
    }

    /// Send to every subscriber; returns how many were listening.
    pub fn publish(&self, frame: RelayFrame) -> usize {
        self.sender.send(Arc::new(frame)).unwrap_or(0)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, conn: u64) -> bool {
        self.members.read().await.contains(&conn)
    }
}

/// Topic name → group.
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    capacity: usize,
    max_members: usize,
}

impl TopicRegistry {
    pub fn new(capacity: usize, max_members: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
            max_members,
        }
    }

    /// Join `topic`, creating it on first use.
    pub async fn join(
        &self,
        topic: &str,
        conn: u64,
    ) -> Result<(Arc<TopicGroup>, broadcast::Receiver<Arc<RelayFrame>>), RelayError> {
        if self.max_members == 0 {
            return Err(RelayError::TopicFull(topic.to_string()));
        }
        let mut topics = self.topics.write().await;
        let group = topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicGroup::new(self.capacity)))
            .clone();

        let mut members = group.members.write().await;
        if members.len() >= self.max_members {
            return Err(RelayError::TopicFull(topic.to_string()));
        }
        members.insert(conn);
        let rx = group.sender.subscribe();
        drop(members);
        Ok((group, rx))
    }

    /// Leave `topic`; returns `true` if the topic was removed as empty.
    pub async fn leave(&self, topic: &str, conn: u64) -> bool {
        let mut topics = self.topics.write().await;
        let Some(group) = topics.get(topic) else {
            return false;
        };
        let empty = {
            let mut members = group.members.write().await;
            members.remove(&conn);
            members.is_empty()
        };
        if empty {
            topics.remove(topic);
        }
        empty
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }
}

// ───────────────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────────────

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<TopicRegistry>,
    counters: Arc<Counters>,
    next_conn: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(TopicRegistry::new(
            config.broadcast_capacity,
            config.max_peers_per_topic,
        ));
        Self {
            config,
            registry,
            counters: Arc::new(Counters::default()),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
            let registry = self.registry.clone();
            let counters = self.counters.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, conn, registry, counters).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            active_topics: self.registry.topic_count().await,
            frames_relayed: self.counters.frames_relayed.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Topic of a request path: `/signal-r1` → `signal-r1`.
pub fn topic_from_path(path: &str) -> Option<String> {
    let topic = path.trim_matches('/');
    if topic.is_empty() {
        None
    } else {
        Some(topic.to_string())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn: u64,
    registry: Arc<TopicRegistry>,
    counters: Arc<Counters>,
) -> Result<(), RelayError> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let Some(topic) = topic_from_path(&path) else {
        log::warn!("Connection from {addr} without a topic");
        let _ = ws_sender.send(Message::Close(None)).await;
        return Ok(());
    };

    let (group, mut frames) = match registry.join(&topic, conn).await {
        Ok(joined) => joined,
        Err(e) => {
            let _ = ws_sender.send(Message::Close(None)).await;
            return Err(e);
        }
    };
    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!("{addr} joined topic {topic} as #{conn}");

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                    group.publish(RelayFrame { from: conn, message });
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection closed from {addr}");
                    break Ok(());
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break Ok(());
                }
                Some(Ok(_)) => {}
            },
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if frame.from == conn {
                        continue;
                    }
                    if let Err(e) = ws_sender.send(frame.message.clone()).await {
                        break Err(e.into());
                    }
                    counters.frames_relayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("#{conn} on {topic} lagged by {n} frames");
                    counters.frames_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    if registry.leave(&topic, conn).await {
        log::info!("Topic {topic} removed (empty)");
    }
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}
