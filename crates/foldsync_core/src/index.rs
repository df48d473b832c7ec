//! Local document index: which root each known document lives in.
//!
//! The index is the only place where a document's root assignment is
//! recorded. Changes go through [`DocumentIndex::transaction`], which persists
//! the whole table atomically before the in-memory copy is swapped, so a
//! failed save leaves both untouched.

use crate::error::{CoreError, CoreResult};
use crate::state::{load_cbor, save_cbor, StateStore};
use crate::types::{DocumentId, RootId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const INDEX_STATE: &str = "index.cbor";

/// One row of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEntry {
    /// The document.
    pub document_id: DocumentId,
    /// Root the document is assigned to.
    pub root_id: RootId,
    /// Optional folder within the root (informational).
    pub folder: Option<String>,
    /// When this instance first registered the document.
    pub created_at: Timestamp,
    /// Last time the row changed.
    pub modified_at: Timestamp,
}

/// Mutable view of the table inside a transaction.
#[derive(Debug)]
pub struct IndexTxn {
    rows: BTreeMap<DocumentId, DocumentEntry>,
}

impl IndexTxn {
    /// Returns a row.
    #[must_use]
    pub fn get(&self, document: &DocumentId) -> Option<&DocumentEntry> {
        self.rows.get(document)
    }

    /// Inserts or replaces a row.
    pub fn put(&mut self, entry: DocumentEntry) {
        self.rows.insert(entry.document_id.clone(), entry);
    }

    /// Removes a row.
    pub fn remove(&mut self, document: &DocumentId) -> Option<DocumentEntry> {
        self.rows.remove(document)
    }
}

/// Persisted document index.
#[derive(Debug)]
pub struct DocumentIndex {
    state: Arc<dyn StateStore>,
    rows: RwLock<BTreeMap<DocumentId, DocumentEntry>>,
}

impl DocumentIndex {
    /// Loads the index from the state store.
    pub fn load(state: Arc<dyn StateStore>) -> CoreResult<Self> {
        let rows: Vec<DocumentEntry> = load_cbor(state.as_ref(), INDEX_STATE)?.unwrap_or_default();
        Ok(Self {
            state,
            rows: RwLock::new(
                rows.into_iter()
                    .map(|row| (row.document_id.clone(), row))
                    .collect(),
            ),
        })
    }

    /// Returns a row.
    #[must_use]
    pub fn get(&self, document: &DocumentId) -> Option<DocumentEntry> {
        self.rows.read().get(document).cloned()
    }

    /// Root a document is assigned to.
    #[must_use]
    pub fn root_of(&self, document: &DocumentId) -> Option<RootId> {
        self.rows.read().get(document).map(|row| row.root_id.clone())
    }

    /// All rows, ordered by document id.
    #[must_use]
    pub fn list(&self) -> Vec<DocumentEntry> {
        self.rows.read().values().cloned().collect()
    }

    /// Rows assigned to one root.
    #[must_use]
    pub fn list_in_root(&self, root: &RootId) -> Vec<DocumentEntry> {
        self.rows
            .read()
            .values()
            .filter(|row| &row.root_id == root)
            .cloned()
            .collect()
    }

    /// Runs `f` against a copy of the table and commits it atomically.
    ///
    /// If `f` fails or the save fails, nothing changes.
    pub fn transaction<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut IndexTxn) -> CoreResult<T>,
    {
        let mut rows = self.rows.write();
        let mut txn = IndexTxn { rows: rows.clone() };
        let out = f(&mut txn)?;
        let snapshot: Vec<&DocumentEntry> = txn.rows.values().collect();
        save_cbor(self.state.as_ref(), INDEX_STATE, &snapshot)?;
        *rows = txn.rows;
        Ok(out)
    }

    /// Registers a document (or refreshes its row).
    pub fn upsert(&self, entry: DocumentEntry) -> CoreResult<()> {
        self.transaction(|txn| {
            txn.put(entry);
            Ok(())
        })
    }

    /// Reassigns a document from one root to another.
    ///
    /// Succeeds without change if the document is already in `to`.
    ///
    /// # Errors
    ///
    /// - `DocumentNotFound` if the document is not indexed
    /// - `InvalidOperation` if it is assigned to neither root
    pub fn reassign(
        &self,
        document: &DocumentId,
        from: &RootId,
        to: &RootId,
        folder: Option<String>,
        now: Timestamp,
    ) -> CoreResult<()> {
        self.transaction(|txn| {
            let mut row = txn
                .remove(document)
                .ok_or_else(|| CoreError::document_not_found(document))?;
            if &row.root_id == to {
                txn.put(row);
                return Ok(());
            }
            if &row.root_id != from {
                return Err(CoreError::invalid_operation(format!(
                    "document {document} is in root {}, not {from}",
                    row.root_id
                )));
            }
            row.root_id = to.clone();
            row.folder = folder;
            row.modified_at = now;
            txn.put(row);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;

    fn entry(doc: &str, root: &str) -> DocumentEntry {
        DocumentEntry {
            document_id: DocumentId::parse(doc).unwrap(),
            root_id: RootId::parse(root).unwrap(),
            folder: None,
            created_at: 1,
            modified_at: 1,
        }
    }

    #[derive(Debug, Default)]
    struct FailingStore;

    impl StateStore for FailingStore {
        fn load(&self, _name: &str) -> CoreResult<Option<Vec<u8>>> {
            Ok(None)
        }

        fn save(&self, name: &str, _data: &[u8]) -> CoreResult<()> {
            Err(CoreError::invalid_state(name, "disk full"))
        }
    }

    #[test]
    fn rows_survive_reload() {
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let index = DocumentIndex::load(state.clone()).unwrap();
        index.upsert(entry("d1", "r1")).unwrap();
        index.upsert(entry("d2", "r2")).unwrap();

        let reloaded = DocumentIndex::load(state).unwrap();
        assert_eq!(reloaded.list().len(), 2);
        assert_eq!(
            reloaded.root_of(&DocumentId::parse("d2").unwrap()),
            Some(RootId::parse("r2").unwrap())
        );
        assert_eq!(reloaded.list_in_root(&RootId::parse("r1").unwrap()).len(), 1);
    }

    #[test]
    fn reassign_moves_between_roots() {
        let index = DocumentIndex::load(Arc::new(MemoryStateStore::new())).unwrap();
        index.upsert(entry("d1", "r1")).unwrap();
        let (doc, r1, r2) = (
            DocumentId::parse("d1").unwrap(),
            RootId::parse("r1").unwrap(),
            RootId::parse("r2").unwrap(),
        );

        index.reassign(&doc, &r1, &r2, Some("inbox".into()), 5).unwrap();
        let row = index.get(&doc).unwrap();
        assert_eq!(row.root_id, r2);
        assert_eq!(row.folder.as_deref(), Some("inbox"));

        // Idempotent once applied.
        index.reassign(&doc, &r1, &r2, None, 6).unwrap();
        assert_eq!(index.get(&doc).unwrap().modified_at, 5);

        let r3 = RootId::parse("r3").unwrap();
        assert!(index.reassign(&doc, &r3, &r1, None, 7).is_err());
    }

    #[test]
    fn failed_save_changes_nothing() {
        let index = DocumentIndex::load(Arc::new(FailingStore)).unwrap();
        assert!(index.upsert(entry("d1", "r1")).is_err());
        assert!(index.list().is_empty());
    }

    #[test]
    fn failed_closure_changes_nothing() {
        let index = DocumentIndex::load(Arc::new(MemoryStateStore::new())).unwrap();
        index.upsert(entry("d1", "r1")).unwrap();
        let result: CoreResult<()> = index.transaction(|txn| {
            txn.remove(&DocumentId::parse("d1").unwrap());
            Err(CoreError::invalid_operation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(index.list().len(), 1);
    }
}
