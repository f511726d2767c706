//! The document channel of a room: replicator + awareness over a
//! [`FrameTransport`].
//!
//! ```text
//!  open ──► SyncStep1(sv) + Awareness(local) ─────────────────► peer
//!  peer ──► SyncStep1(sv) ──► reply SyncStep2(diff)
//!                             (+ our SyncStep1 and awareness the first
//!                              time we hear from that peer)
//!  peer ──► SyncStep2 / Update ──► Replicator::apply_remote_update
//!  peer ──► Awareness ──► AwarenessMap::apply
//!  every 15s ──► Awareness(renewed local), peers silent for 30s dropped
//!  channel ends ──► every remote peer dropped
//!  close ──► Awareness(Leave), transport closed, replicator torn down
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::awareness::{AwarenessMap, AwarenessMessage, AwarenessState, TextCursor};
use crate::error::ReplicationError;
use crate::protocol::{ClientId, DocFrame, FrameType};
use crate::replication::{EditorModel, Replicator, TextEdit};
use crate::transport::FrameTransport;

/// How often the local awareness record is re-announced.
pub const AWARENESS_RENEW_INTERVAL: Duration = Duration::from_secs(15);
/// A remote record not renewed for this long is dropped.
pub const AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

struct Shared {
    local_id: ClientId,
    replicator: Mutex<Replicator>,
    awareness: Mutex<AwarenessMap>,
    transport: Arc<dyn FrameTransport>,
    clock: AtomicU64,
    greeted: Mutex<HashSet<ClientId>>,
    /// Bumped on every text change, local or remote
    revision: watch::Sender<u64>,
}

impl Shared {
    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    async fn send(&self, frame: DocFrame) {
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(bytes).await {
                    log::debug!(target: "tandem::doc", "document frame not sent: {e}");
                }
            }
            Err(e) => log::error!(target: "tandem::doc", "encoding document frame failed: {e}"),
        }
    }

    async fn send_awareness(&self, msg: AwarenessMessage) {
        match msg.encode() {
            Ok(payload) => {
                self.send(DocFrame::awareness(self.local_id, self.next_clock(), payload))
                    .await
            }
            Err(e) => log::error!(target: "tandem::doc", "encoding awareness failed: {e}"),
        }
    }

    async fn send_sync_step1(&self) {
        let sv = self.replicator.lock().state_vector();
        match sv {
            Ok(sv) => self.send(DocFrame::sync_step1(self.local_id, sv)).await,
            Err(e) => log::debug!(target: "tandem::doc", "no sync step 1: {e}"),
        }
    }

    async fn handle_frame(&self, frame: DocFrame) {
        if frame.sender == self.local_id {
            return;
        }
        match frame.frame_type {
            FrameType::SyncStep1 => {
                let diff = self.replicator.lock().diff_since(&frame.payload);
                match diff {
                    Ok(diff) => self.send(DocFrame::sync_step2(self.local_id, diff)).await,
                    Err(e) => log::warn!(target: "tandem::doc", "bad state vector from {}: {e}", frame.sender),
                }
                let first_contact = self.greeted.lock().insert(frame.sender);
                if first_contact {
                    self.send_sync_step1().await;
                    let local = self.awareness.lock().local_update();
                    if let Some(msg) = local {
                        self.send_awareness(msg).await;
                    }
                }
            }
            FrameType::SyncStep2 | FrameType::Update => {
                let applied = self.replicator.lock().apply_remote_update(&frame.payload);
                match applied {
                    Ok(true) => self.bump_revision(),
                    Ok(false) => {}
                    Err(e) => log::warn!(target: "tandem::doc", "dropping update from {}: {e}", frame.sender),
                }
            }
            FrameType::Awareness => match AwarenessMessage::decode(&frame.payload) {
                Ok(msg) => {
                    if self.awareness.lock().apply(&msg) {
                        log::trace!(target: "tandem::doc", "awareness from {}", msg.client_id());
                    }
                }
                Err(e) => log::warn!(target: "tandem::doc", "dropping awareness frame: {e}"),
            },
        }
    }

    /// The channel to the peers ended: nobody on the other side remains.
    fn drop_remote_peers(&self) {
        self.greeted.lock().clear();
        let gone = self.awareness.lock().remove_remote_peers();
        for id in gone {
            log::info!(target: "tandem::doc", "peer {id} gone with the document channel");
        }
    }

    async fn renew_awareness(&self) {
        let renewed = self.awareness.lock().renew_local();
        if let Some(msg) = renewed {
            self.send_awareness(msg).await;
        }
        let stale = self
            .awareness
            .lock()
            .prune_stale(Instant::now(), AWARENESS_TIMEOUT);
        for id in stale {
            self.greeted.lock().remove(&id);
            log::info!(target: "tandem::doc", "peer {id} timed out");
        }
    }
}

/// An open document channel.
pub struct DocumentLink {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentLink {
    /// Start replicating over `transport`: spawn the reader, send our state
    /// vector and our awareness record.
    pub async fn open(
        local_id: ClientId,
        user_name: &str,
        editor: Box<dyn EditorModel>,
        transport: Arc<dyn FrameTransport>,
    ) -> Result<Self, ReplicationError> {
        let mut incoming = transport.take_receiver().ok_or_else(|| {
            ReplicationError::Crdt("document transport receiver already taken".into())
        })?;

        let mut replicator = Replicator::new();
        replicator.bind_editor(editor);
        let (revision, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            local_id,
            replicator: Mutex::new(replicator),
            awareness: Mutex::new(AwarenessMap::new(local_id, user_name)),
            transport,
            clock: AtomicU64::new(0),
            greeted: Mutex::new(HashSet::new()),
            revision,
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(bytes) = incoming.recv().await {
                match DocFrame::decode(&bytes) {
                    Ok(frame) => reader_shared.handle_frame(frame).await,
                    Err(e) => log::warn!(target: "tandem::doc", "dropping unparsable frame: {e}"),
                }
            }
            log::debug!(target: "tandem::doc", "document channel closed");
            reader_shared.drop_remote_peers();
        });

        let keepalive_shared = shared.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = interval_at(
                Instant::now() + AWARENESS_RENEW_INTERVAL,
                AWARENESS_RENEW_INTERVAL,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                keepalive_shared.renew_awareness().await;
            }
        });

        shared.send_sync_step1().await;
        let local = shared.awareness.lock().local_update();
        if let Some(msg) = local {
            shared.send_awareness(msg).await;
        }
        log::info!(target: "tandem::doc", "document channel open for {local_id}");

        Ok(Self {
            shared,
            reader: Mutex::new(Some(reader)),
            keepalive: Mutex::new(Some(keepalive)),
        })
    }

    pub fn local_id(&self) -> ClientId {
        self.shared.local_id
    }

    /// An edit the user made in the editor; applied locally and broadcast.
    pub async fn edit(&self, edit: TextEdit) -> Result<(), ReplicationError> {
        if edit.is_noop() {
            return Ok(());
        }
        let update = self.shared.replicator.lock().local_edit(&edit)?;
        self.shared.bump_revision();
        let clock = self.shared.next_clock();
        self.shared
            .send(DocFrame::update(self.shared.local_id, clock, update))
            .await;
        Ok(())
    }

    /// Seed the template if the document is empty at this moment.
    pub async fn seed_if_empty(&self, template: &str) -> Result<bool, ReplicationError> {
        let seeded = self.shared.replicator.lock().seed_if_empty(template)?;
        match seeded {
            Some(update) => {
                self.shared.bump_revision();
                let clock = self.shared.next_clock();
                self.shared
                    .send(DocFrame::update(self.shared.local_id, clock, update))
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move the local cursor and broadcast it.
    pub async fn set_cursor(&self, cursor: Option<TextCursor>) {
        let msg = self.shared.awareness.lock().update_local_cursor(cursor);
        if let Some(msg) = msg {
            self.shared.send_awareness(msg).await;
        }
    }

    pub fn text(&self) -> String {
        self.shared.replicator.lock().text()
    }

    pub fn editor_text(&self) -> Option<String> {
        self.shared.replicator.lock().editor_text()
    }

    pub fn awareness(&self) -> Vec<AwarenessState> {
        self.shared.awareness.lock().states()
    }

    /// Watch the text revision; changes on every local or remote text change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.lock().is_none()
    }

    /// Announce our departure, stop the reader, close the transport and
    /// release the document. Returns the editor model that was bound.
    pub async fn close(&self) -> Option<Box<dyn EditorModel>> {
        let reader = self.reader.lock().take()?;
        if let Some(keepalive) = self.keepalive.lock().take() {
            keepalive.abort();
        }
        let leave = self.shared.awareness.lock().leave();
        if let Some(msg) = leave {
            self.shared.send_awareness(msg).await;
        }
        reader.abort();
        self.shared.transport.close().await;
        let editor = self.shared.replicator.lock().teardown();
        log::info!(target: "tandem::doc", "document channel closed for {}", self.shared.local_id);
        editor
    }
}
