//! Awareness: ephemeral per-peer presence carried on the document channel.
//!
//! ## Architecture
//!
//! ```text
//! local cursor move / profile
//!       │
//!       ▼
//! AwarenessMap::update_local_cursor()   (own clock += 1)
//!       │
//!       ▼
//! AwarenessMessage::Update { state }    (bincode, inside DocFrame::Awareness)
//!       │
//!       ▼
//! remote AwarenessMap::apply()          (last-write-wins per peer clock)
//! ```
//!
//! The map holds one entry per participant, the local one included. A
//! `Leave` removes the entry and leaves a tombstone clock behind so a
//! late-arriving stale update cannot resurrect it. A peer that vanishes
//! without a `Leave` is dropped once it stops renewing its record
//! ([`AwarenessMap::prune_stale`]) or when the channel to it ends.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ProtocolError;
use crate::protocol::ClientId;

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Display color of a participant, stable for a given id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PeerColor {
    /// Derive a vivid color from the id: hue from the id, fixed S and L.
    pub fn from_client_id(id: ClientId) -> Self {
        let hash = id.as_uuid().as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    /// CSS hex form, e.g. `#4285f5`.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Records and wire messages
// ───────────────────────────────────────────────────────────────────

/// A text selection in byte offsets; `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCursor {
    pub anchor: usize,
    pub head: usize,
}

/// Presence fields of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub client_id: ClientId,
    pub user_name: String,
    pub color: PeerColor,
    pub cursor: Option<TextCursor>,
    /// Owner-local clock; higher wins
    pub clock: u64,
}

/// Awareness payload of a `DocFrame::Awareness`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Update { state: AwarenessState },
    Leave { client_id: ClientId, clock: u64 },
}

impl AwarenessMessage {
    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessMessage::Update { state } => state.client_id,
            AwarenessMessage::Leave { client_id, .. } => *client_id,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            AwarenessMessage::Update { state } => state.clock,
            AwarenessMessage::Leave { clock, .. } => *clock,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness map
// ───────────────────────────────────────────────────────────────────

/// All participants' presence, the local one included.
pub struct AwarenessMap {
    local_id: ClientId,
    states: HashMap<ClientId, AwarenessState>,
    /// Clock at which a peer left
    departed: HashMap<ClientId, u64>,
    /// When each remote record was last renewed
    last_seen: HashMap<ClientId, Instant>,
}

impl AwarenessMap {
    pub fn new(local_id: ClientId, user_name: impl Into<String>) -> Self {
        let mut states = HashMap::new();
        states.insert(
            local_id,
            AwarenessState {
                client_id: local_id,
                user_name: user_name.into(),
                color: PeerColor::from_client_id(local_id),
                cursor: None,
                clock: 1,
            },
        );
        Self {
            local_id,
            states,
            departed: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// The local record as an outgoing message.
    pub fn local_update(&self) -> Option<AwarenessMessage> {
        self.states
            .get(&self.local_id)
            .map(|state| AwarenessMessage::Update {
                state: state.clone(),
            })
    }

    fn bump_local(&mut self, f: impl FnOnce(&mut AwarenessState)) -> Option<AwarenessMessage> {
        let state = self.states.get_mut(&self.local_id)?;
        f(state);
        state.clock += 1;
        Some(AwarenessMessage::Update {
            state: state.clone(),
        })
    }

    /// Move the local cursor; returns the update to broadcast.
    pub fn update_local_cursor(&mut self, cursor: Option<TextCursor>) -> Option<AwarenessMessage> {
        self.bump_local(|s| s.cursor = cursor)
    }

    /// Re-announce the local record with a fresh clock so peers keep it.
    pub fn renew_local(&mut self) -> Option<AwarenessMessage> {
        self.bump_local(|_| {})
    }

    /// Remove the local entry and produce the matching `Leave`.
    pub fn leave(&mut self) -> Option<AwarenessMessage> {
        let state = self.states.remove(&self.local_id)?;
        let clock = state.clock + 1;
        self.departed.insert(self.local_id, clock);
        Some(AwarenessMessage::Leave {
            client_id: self.local_id,
            clock,
        })
    }

    /// Apply a remote message. Returns whether the map changed.
    pub fn apply(&mut self, msg: &AwarenessMessage) -> bool {
        let id = msg.client_id();
        if id == self.local_id {
            return false;
        }
        if self.departed.get(&id).is_some_and(|&gone| msg.clock() <= gone) {
            return false;
        }
        let current = self.states.get(&id).map(|s| s.clock);
        if current.is_some_and(|c| msg.clock() <= c) {
            return false;
        }

        match msg {
            AwarenessMessage::Update { state } => {
                self.states.insert(id, state.clone());
                self.last_seen.insert(id, Instant::now());
            }
            AwarenessMessage::Leave { clock, .. } => {
                self.states.remove(&id);
                self.last_seen.remove(&id);
                self.departed.insert(id, *clock);
            }
        }
        true
    }

    /// Drop a peer without a `Leave` (its transport vanished).
    pub fn remove_peer(&mut self, id: ClientId) -> bool {
        if id == self.local_id {
            return false;
        }
        self.last_seen.remove(&id);
        self.states.remove(&id).is_some()
    }

    /// Drop every remote peer; returns the removed ids.
    pub fn remove_remote_peers(&mut self) -> Vec<ClientId> {
        let remote: Vec<ClientId> = self
            .states
            .keys()
            .copied()
            .filter(|id| *id != self.local_id)
            .collect();
        for id in &remote {
            self.remove_peer(*id);
        }
        remote
    }

    /// Drop remote peers whose record was not renewed within `timeout`.
    pub fn prune_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.remove_peer(*id);
        }
        stale
    }

    pub fn get(&self, id: &ClientId) -> Option<&AwarenessState> {
        self.states.get(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Snapshot of every entry, ordered by client id.
    pub fn states(&self) -> Vec<AwarenessState> {
        let mut all: Vec<_> = self.states.values().cloned().collect();
        all.sort_by_key(|s| s.client_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (AwarenessMap, AwarenessMap) {
        (
            AwarenessMap::new(ClientId::random(), "alice"),
            AwarenessMap::new(ClientId::random(), "bob"),
        )
    }

    #[test]
    fn test_color_stable_per_id() {
        let id = ClientId::random();
        assert_eq!(PeerColor::from_client_id(id), PeerColor::from_client_id(id));
        assert_eq!(PeerColor::from_client_id(id).to_hex().len(), 7);
    }

    #[test]
    fn test_hsl_achromatic() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_local_entry_present() {
        let (a, _) = pair();
        assert_eq!(a.len(), 1);
        assert_eq!(a.get(&a.local_id()).unwrap().user_name, "alice");
    }

    #[test]
    fn test_exchange_yields_two_entries() {
        let (mut a, mut b) = pair();
        assert!(b.apply(&a.local_update().unwrap()));
        assert!(a.apply(&b.local_update().unwrap()));
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_last_write_wins_per_peer() {
        let (mut a, mut b) = pair();
        let older = a.update_local_cursor(Some(TextCursor { anchor: 1, head: 1 })).unwrap();
        let newer = a.update_local_cursor(Some(TextCursor { anchor: 5, head: 7 })).unwrap();

        assert!(b.apply(&newer));
        assert!(!b.apply(&older));
        let seen = b.get(&a.local_id()).unwrap();
        assert_eq!(seen.cursor, Some(TextCursor { anchor: 5, head: 7 }));
    }

    #[test]
    fn test_leave_removes_and_blocks_stale_updates() {
        let (mut a, mut b) = pair();
        let update = a.local_update().unwrap();
        b.apply(&update);
        let leave = a.leave().unwrap();
        assert!(b.apply(&leave));
        assert!(b.get(&a.local_id()).is_none());
        assert!(!b.apply(&update));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_own_echo_ignored() {
        let (mut a, _) = pair();
        let msg = a.update_local_cursor(None).unwrap();
        assert!(!a.apply(&msg));
    }

    #[test]
    fn test_remove_peer_never_removes_self() {
        let (mut a, mut b) = pair();
        b.apply(&a.local_update().unwrap());
        assert!(!b.remove_peer(b.local_id()));
        assert!(b.remove_peer(a.local_id()));
        assert!(!a.remove_peer(a.local_id()));
    }

    #[test]
    fn test_remove_remote_peers_keeps_local() {
        let (a, mut b) = pair();
        b.apply(&a.local_update().unwrap());
        assert_eq!(b.remove_remote_peers(), vec![a.local_id()]);
        assert_eq!(b.len(), 1);
        assert!(b.get(&b.local_id()).is_some());
    }

    #[test]
    fn test_stale_peer_pruned_unless_renewed() {
        let (mut a, mut b) = pair();
        b.apply(&a.local_update().unwrap());
        let start = Instant::now();
        let timeout = Duration::from_secs(30);

        assert!(b.prune_stale(start + Duration::from_secs(10), timeout).is_empty());
        assert!(b.apply(&a.renew_local().unwrap()));
        assert!(b.prune_stale(start + Duration::from_secs(25), timeout).is_empty());

        let pruned = b.prune_stale(Instant::now() + Duration::from_secs(31), timeout);
        assert_eq!(pruned, vec![a.local_id()]);
        assert_eq!(b.len(), 1);
        // Renewal after pruning brings the peer back.
        assert!(b.apply(&a.renew_local().unwrap()));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_message_decode_rejects_garbage() {
        assert!(AwarenessMessage::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
