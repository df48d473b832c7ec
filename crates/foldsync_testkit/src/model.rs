//! A `yrs`-backed text document.
//!
//! Every document holds one shared text named [`TEXT_NAME`]. Updates are
//! Yjs v1 updates, so replicas converge whatever order they arrive in.

use foldsync_core::{CoreError, CoreResult, DocumentModel, MergeableDocument};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the shared text inside every document.
pub const TEXT_NAME: &str = "content";

/// One replica of a text document.
pub struct YrsDocument {
    doc: Doc,
    text: TextRef,
}

impl YrsDocument {
    /// Creates an empty document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self { doc, text }
    }

    /// Current text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Appends `chunk` and returns the update describing the edit.
    pub fn append(&mut self, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let len = self.text.len(&txn);
        self.text.insert(&mut txn, len, chunk);
        txn.encode_update_v1()
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for YrsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsDocument")
            .field("text", &self.text())
            .finish()
    }
}

impl MergeableDocument for YrsDocument {
    fn apply_update(&mut self, update: &[u8]) -> CoreResult<()> {
        let update =
            Update::decode_v1(update).map_err(|err| CoreError::apply_failed(err.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|err| CoreError::apply_failed(err.to_string()))
    }

    fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

/// Factory for [`YrsDocument`]s.
///
/// Buffered updates are flushed one file each; yrs updates are only merged
/// through a live document.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsModel;

impl DocumentModel for YrsModel {
    type Document = YrsDocument;

    fn new_document(&self) -> YrsDocument {
        YrsDocument::new()
    }
}

/// Editing layer of one instance.
///
/// Holds its own replica, so appended text lands after everything the editor
/// has seen, and hands out the update bytes the engine is fed with.
#[derive(Debug, Default)]
pub struct TextEditor {
    replica: YrsDocument,
}

impl TextEditor {
    /// An editor with an empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrates remote state (for example a full state from the engine).
    pub fn observe(&mut self, update: &[u8]) -> CoreResult<()> {
        self.replica.apply_update(update)
    }

    /// Appends text and returns the update.
    pub fn append(&mut self, chunk: &str) -> Vec<u8> {
        self.replica.append(chunk)
    }

    /// Text as the editor sees it.
    pub fn text(&self) -> String {
        self.replica.text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_converge_in_any_order() {
        let mut a = TextEditor::new();
        let mut b = TextEditor::new();
        let u1 = a.append("hello ");
        let u2 = b.append("world");

        let mut x = YrsModel.new_document();
        x.apply_update(&u1).unwrap();
        x.apply_update(&u2).unwrap();
        let mut y = YrsModel.new_document();
        y.apply_update(&u2).unwrap();
        y.apply_update(&u1).unwrap();
        y.apply_update(&u1).unwrap();

        assert_eq!(x.text(), y.text());
        assert_eq!(x.text().len(), "hello world".len());
    }

    #[test]
    fn full_state_seeds_a_replica() {
        let mut editor = TextEditor::new();
        let mut doc = YrsModel.new_document();
        doc.apply_update(&editor.append("abc")).unwrap();

        let mut copy = YrsModel.new_document();
        copy.apply_update(&doc.encode_full_state()).unwrap();
        assert_eq!(copy.text(), "abc");
    }

    #[test]
    fn empty_state_is_a_valid_update() {
        let empty = YrsModel.new_document().encode_full_state();
        let mut doc = YrsModel.new_document();
        doc.apply_update(&empty).unwrap();
        assert_eq!(doc.text(), "");
    }

    #[test]
    fn garbage_is_rejected() {
        let mut doc = YrsModel.new_document();
        assert!(doc.apply_update(&[0xff, 0xff, 0xff]).is_err());
    }
}
