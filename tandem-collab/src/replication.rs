//! Document replication: a yrs text bound to an editor model.
//!
//! ```text
//!  editor keystroke ──► Replicator::local_edit ──► CRDT txn ──► update bytes ──► peer
//!                                                                                  │
//!  editor model ◄── one diffed replace ◄── Replicator::apply_remote_update ◄────────┘
//! ```
//!
//! A local edit already lives in the editor, so the replicator applies it to
//! the CRDT only and never writes it back. Remote updates are merged, then the
//! editor is brought in line with a single prefix/suffix-diffed replace; an
//! update that changes nothing (a replay) touches nothing.
//!
//! Offsets are UTF-8 byte offsets and must fall on char boundaries.
//!
//! Seeding uses a client id derived from the template, so two replicas that
//! both find the document empty and seed the same template produce the same
//! CRDT item and merge to a single copy.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::ReplicationError;

/// Name of the shared text inside the document.
pub const TEXT_NAME: &str = "monaco";

/// A single replace on the text: delete `delete_len` bytes at `offset`,
/// then insert `insert` there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub offset: usize,
    pub delete_len: usize,
    pub insert: String,
}

impl TextEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            delete_len: 0,
            insert: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            delete_len: len,
            insert: String::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.delete_len == 0 && self.insert.is_empty()
    }

    /// Apply to a plain string. Caller guarantees bounds.
    pub fn apply_to(&self, text: &mut String) {
        text.replace_range(self.offset..self.offset + self.delete_len, &self.insert);
    }

    /// Minimal single replace turning `old` into `new`.
    pub fn diff(old: &str, new: &str) -> Option<Self> {
        if old == new {
            return None;
        }
        let prefix = old
            .char_indices()
            .zip(new.chars())
            .find(|((_, a), b)| a != b)
            .map(|((i, _), _)| i)
            .unwrap_or_else(|| old.len().min(new.len()));
        let prefix = floor_char_boundary(new, floor_char_boundary(old, prefix));

        let max_suffix = (old.len() - prefix).min(new.len() - prefix);
        let mut suffix = old
            .as_bytes()
            .iter()
            .rev()
            .zip(new.as_bytes().iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();
        while suffix > 0
            && !(old.is_char_boundary(old.len() - suffix) && new.is_char_boundary(new.len() - suffix))
        {
            suffix -= 1;
        }

        Some(Self {
            offset: prefix,
            delete_len: old.len() - suffix - prefix,
            insert: new[prefix..new.len() - suffix].to_string(),
        })
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ───────────────────────────────────────────────────────────────────
// Editor model
// ───────────────────────────────────────────────────────────────────

/// The editor's text model as seen by the replicator.
pub trait EditorModel: Send {
    fn text(&self) -> String;

    /// Replace the whole content (used once when binding).
    fn set_text(&mut self, text: &str);

    /// Apply an edit that arrived from the other participant.
    fn apply_remote(&mut self, edit: &TextEdit);

    /// Apply an edit the user typed.
    fn apply_local(&mut self, edit: &TextEdit);
}

/// In-memory editor model.
#[derive(Debug, Default, Clone)]
pub struct EditorBuffer {
    text: String,
    remote_edits: usize,
}

impl EditorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of edits applied from the replication path.
    pub fn remote_edits(&self) -> usize {
        self.remote_edits
    }
}

impl EditorModel for EditorBuffer {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    fn apply_remote(&mut self, edit: &TextEdit) {
        edit.apply_to(&mut self.text);
        self.remote_edits += 1;
    }

    fn apply_local(&mut self, edit: &TextEdit) {
        edit.apply_to(&mut self.text);
    }
}

// ───────────────────────────────────────────────────────────────────
// Replicator
// ───────────────────────────────────────────────────────────────────

/// Owns the room's CRDT document and its single editor binding.
pub struct Replicator {
    doc: Option<Doc>,
    text: TextRef,
    editor: Option<Box<dyn EditorModel>>,
}

impl Replicator {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self {
            doc: Some(doc),
            text,
            editor: None,
        }
    }

    fn doc(&self) -> Result<&Doc, ReplicationError> {
        self.doc.as_ref().ok_or(ReplicationError::TornDown)
    }

    pub fn is_torn_down(&self) -> bool {
        self.doc.is_none()
    }

    /// Current CRDT text.
    pub fn text(&self) -> String {
        match &self.doc {
            Some(doc) => {
                let txn = doc.transact();
                self.text.get_string(&txn)
            }
            None => String::new(),
        }
    }

    /// Bind the editor model, replacing its content with the CRDT text.
    ///
    /// Only one binding exists; a previous one is returned.
    pub fn bind_editor(&mut self, mut editor: Box<dyn EditorModel>) -> Option<Box<dyn EditorModel>> {
        editor.set_text(&self.text());
        self.editor.replace(editor)
    }

    pub fn unbind_editor(&mut self) -> Option<Box<dyn EditorModel>> {
        self.editor.take()
    }

    pub fn editor_text(&self) -> Option<String> {
        self.editor.as_ref().map(|e| e.text())
    }

    /// An edit the user made in the bound editor.
    ///
    /// Applies it to the editor model and the CRDT and returns the update
    /// to broadcast. The replication path never re-applies it to the editor.
    pub fn local_edit(&mut self, edit: &TextEdit) -> Result<Vec<u8>, ReplicationError> {
        let update = self.apply_to_crdt(edit)?;
        if let Some(editor) = self.editor.as_mut() {
            editor.apply_local(edit);
        }
        Ok(update)
    }

    fn apply_to_crdt(&self, edit: &TextEdit) -> Result<Vec<u8>, ReplicationError> {
        let doc = self.doc()?;
        let mut txn = doc.transact_mut();
        let current = self.text.get_string(&txn);
        let end = edit.offset.checked_add(edit.delete_len);
        let in_bounds = end.is_some_and(|end| end <= current.len())
            && current.is_char_boundary(edit.offset)
            && end.is_some_and(|end| current.is_char_boundary(end));
        if !in_bounds {
            return Err(ReplicationError::OutOfBounds {
                offset: edit.offset,
                len: edit.delete_len,
                text_len: current.len(),
            });
        }
        if edit.delete_len > 0 {
            self.text
                .remove_range(&mut txn, edit.offset as u32, edit.delete_len as u32);
        }
        if !edit.insert.is_empty() {
            self.text.insert(&mut txn, edit.offset as u32, &edit.insert);
        }
        Ok(txn.encode_update_v1())
    }

    /// Merge an update from the other participant and reflect it into the
    /// editor. Returns whether the text changed.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<bool, ReplicationError> {
        let before = self.text();
        {
            let doc = self.doc()?;
            let update = Update::decode_v1(update)?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ReplicationError::Crdt(e.to_string()))?;
        }
        let after = self.text();
        if before == after {
            return Ok(false);
        }
        self.reflect_into_editor(&after);
        Ok(true)
    }

    fn reflect_into_editor(&mut self, crdt_text: &str) {
        if let Some(editor) = self.editor.as_mut() {
            let shown = editor.text();
            if let Some(edit) = TextEdit::diff(&shown, crdt_text) {
                log::trace!(
                    target: "tandem::doc",
                    "remote edit at {} (-{} +{})",
                    edit.offset,
                    edit.delete_len,
                    edit.insert.len()
                );
                editor.apply_remote(&edit);
            }
        }
    }

    /// Insert `template` if, and only if, the document is empty right now.
    ///
    /// Returns the seed update to broadcast, or `None` when content already
    /// existed.
    pub fn seed_if_empty(&mut self, template: &str) -> Result<Option<Vec<u8>>, ReplicationError> {
        if template.is_empty() {
            return Ok(None);
        }
        let seed = seed_update(template);
        {
            let doc = self.doc()?;
            let mut txn = doc.transact_mut();
            if self.text.len(&txn) > 0 {
                return Ok(None);
            }
            let update = Update::decode_v1(&seed)?;
            txn.apply_update(update)
                .map_err(|e| ReplicationError::Crdt(e.to_string()))?;
        }
        log::debug!(target: "tandem::doc", "seeded document with {} bytes", template.len());
        let text = self.text();
        self.reflect_into_editor(&text);
        Ok(Some(seed))
    }

    /// Encoded state vector (sync step 1 payload).
    pub fn state_vector(&self) -> Result<Vec<u8>, ReplicationError> {
        let doc = self.doc()?;
        let txn = doc.transact();
        Ok(txn.state_vector().encode_v1())
    }

    /// Everything the holder of `state_vector` is missing (sync step 2 payload).
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicationError> {
        let sv = StateVector::decode_v1(state_vector)?;
        let doc = self.doc()?;
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Release the editor binding and the document. Idempotent.
    pub fn teardown(&mut self) -> Option<Box<dyn EditorModel>> {
        if self.doc.take().is_some() {
            log::debug!(target: "tandem::doc", "replicator torn down");
        }
        self.editor.take()
    }
}

impl Default for Replicator {
    fn default() -> Self {
        Self::new()
    }
}

/// Client id the seed of `template` is authored under.
fn seed_client_id(template: &str) -> u64 {
    // FNV-1a, kept below 2^53 and non-zero
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in template.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash & ((1 << 53) - 1)).max(1)
}

/// The deterministic update inserting `template` into an empty document.
fn seed_update(template: &str) -> Vec<u8> {
    let doc = Doc::with_client_id(seed_client_id(template));
    let text = doc.get_or_insert_text(TEXT_NAME);
    let mut txn = doc.transact_mut();
    text.insert(&mut txn, 0, template);
    txn.encode_update_v1()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound() -> Replicator {
        let mut r = Replicator::new();
        r.bind_editor(Box::new(EditorBuffer::new()));
        r
    }

    #[test]
    fn test_diff_insert_middle() {
        let edit = TextEdit::diff("hello world", "hello big world").unwrap();
        assert_eq!(edit, TextEdit::insert(6, "big "));
    }

    #[test]
    fn test_diff_delete_and_identical() {
        assert_eq!(TextEdit::diff("abcdef", "abef").unwrap(), TextEdit::delete(2, 2));
        assert!(TextEdit::diff("same", "same").is_none());
    }

    #[test]
    fn test_diff_respects_char_boundaries() {
        let old = "naïve";
        let new = "naive";
        let edit = TextEdit::diff(old, new).unwrap();
        let mut s = old.to_string();
        edit.apply_to(&mut s);
        assert_eq!(s, new);
    }

    #[test]
    fn test_diff_repeated_chars() {
        let edit = TextEdit::diff("aaa", "aaaa").unwrap();
        let mut s = "aaa".to_string();
        edit.apply_to(&mut s);
        assert_eq!(s, "aaaa");
    }

    #[test]
    fn test_local_edit_updates_editor_and_crdt() {
        let mut r = bound();
        let update = r.local_edit(&TextEdit::insert(0, "fn main() {}")).unwrap();
        assert!(!update.is_empty());
        assert_eq!(r.text(), "fn main() {}");
        assert_eq!(r.editor_text().unwrap(), "fn main() {}");
    }

    #[test]
    fn test_out_of_bounds_edit_rejected() {
        let mut r = bound();
        r.local_edit(&TextEdit::insert(0, "abc")).unwrap();
        let err = r.local_edit(&TextEdit::delete(2, 5)).unwrap_err();
        assert!(matches!(err, ReplicationError::OutOfBounds { .. }));
        assert_eq!(r.text(), "abc");
    }

    #[test]
    fn test_mid_char_edit_rejected() {
        let mut r = bound();
        r.local_edit(&TextEdit::insert(0, "é")).unwrap();
        assert!(r.local_edit(&TextEdit::insert(1, "x")).is_err());
    }

    #[test]
    fn test_remote_update_reflected_once() {
        let mut a = bound();
        let mut b = Replicator::new();
        let editor = EditorBuffer::new();
        b.bind_editor(Box::new(editor));

        let update = a.local_edit(&TextEdit::insert(0, "hello")).unwrap();
        assert!(b.apply_remote_update(&update).unwrap());
        assert_eq!(b.editor_text().unwrap(), "hello");

        // Replay is a no-op.
        assert!(!b.apply_remote_update(&update).unwrap());
        assert_eq!(b.text(), "hello");
    }

    #[test]
    fn test_local_edit_not_fed_back() {
        let mut a = Replicator::new();
        let mut editor = EditorBuffer::new();
        editor.set_text("");
        a.bind_editor(Box::new(editor));

        let update = a.local_edit(&TextEdit::insert(0, "x")).unwrap();
        // Own update echoed back by a relay: nothing changes.
        assert!(!a.apply_remote_update(&update).unwrap());
        assert_eq!(a.editor_text().unwrap(), "x");
    }

    #[test]
    fn test_seed_only_when_empty() {
        let mut r = bound();
        assert!(r.seed_if_empty("template").unwrap().is_some());
        assert!(r.seed_if_empty("template").unwrap().is_none());
        assert_eq!(r.text(), "template");
        assert_eq!(r.editor_text().unwrap(), "template");
    }

    #[test]
    fn test_seed_skipped_when_peer_content_arrived() {
        let mut a = bound();
        let mut b = bound();
        let update = a.local_edit(&TextEdit::insert(0, "peer code")).unwrap();
        b.apply_remote_update(&update).unwrap();
        assert!(b.seed_if_empty("template").unwrap().is_none());
        assert_eq!(b.text(), "peer code");
    }

    #[test]
    fn test_concurrent_identical_seeds_merge_to_one_copy() {
        let mut a = bound();
        let mut b = bound();
        let seed_a = a.seed_if_empty("class Solution:\n").unwrap().unwrap();
        let seed_b = b.seed_if_empty("class Solution:\n").unwrap().unwrap();
        a.apply_remote_update(&seed_b).unwrap();
        b.apply_remote_update(&seed_a).unwrap();
        assert_eq!(a.text(), "class Solution:\n");
        assert_eq!(b.text(), "class Solution:\n");
    }

    #[test]
    fn test_sync_handshake_brings_peer_up_to_date() {
        let mut a = bound();
        a.local_edit(&TextEdit::insert(0, "abc")).unwrap();
        let mut b = bound();
        b.local_edit(&TextEdit::insert(0, "xyz")).unwrap();

        let diff_for_b = a.diff_since(&b.state_vector().unwrap()).unwrap();
        let diff_for_a = b.diff_since(&a.state_vector().unwrap()).unwrap();
        b.apply_remote_update(&diff_for_b).unwrap();
        a.apply_remote_update(&diff_for_a).unwrap();
        assert_eq!(a.text(), b.text());
        assert_eq!(a.text().len(), 6);
        assert_eq!(a.editor_text(), Some(a.text()));
        assert_eq!(b.editor_text(), Some(b.text()));
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut r = bound();
        r.local_edit(&TextEdit::insert(0, "abc")).unwrap();
        let editor = r.teardown();
        assert!(editor.is_some());
        assert!(r.is_torn_down());
        assert_eq!(
            r.local_edit(&TextEdit::insert(0, "x")).unwrap_err(),
            ReplicationError::TornDown
        );
        assert!(r.teardown().is_none());
    }

    #[test]
    fn test_garbage_update_rejected() {
        let mut r = bound();
        assert!(r.apply_remote_update(&[0xFF, 0x00, 0xAB]).is_err());
    }

    #[test]
    fn test_seed_client_id_depends_on_template() {
        assert_eq!(seed_client_id("a"), seed_client_id("a"));
        assert_ne!(seed_client_id("a"), seed_client_id("b"));
        assert!(seed_client_id("") > 0);
    }
}
