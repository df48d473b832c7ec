//! Instance-local state persistence.
//!
//! Small state files (index, sequence counters, cursors, pending imports) are
//! stored as whole CBOR blobs under a name. A save replaces the blob
//! atomically: after a crash a reader sees either the old or the new value.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Named blob store for instance-local state.
pub trait StateStore: Send + Sync + Debug {
    /// Loads a blob, or `None` if it was never saved.
    fn load(&self, name: &str) -> CoreResult<Option<Vec<u8>>>;

    /// Replaces a blob atomically.
    fn save(&self, name: &str, data: &[u8]) -> CoreResult<()>;
}

/// Loads and decodes a CBOR state blob.
pub fn load_cbor<T: DeserializeOwned>(store: &dyn StateStore, name: &str) -> CoreResult<Option<T>> {
    match store.load(name)? {
        None => Ok(None),
        Some(data) if data.is_empty() => Ok(None),
        Some(data) => ciborium::de::from_reader(data.as_slice())
            .map(Some)
            .map_err(|e| CoreError::invalid_state(name, e.to_string())),
    }
}

/// Encodes and saves a CBOR state blob.
pub fn save_cbor<T: Serialize>(store: &dyn StateStore, name: &str, value: &T) -> CoreResult<()> {
    let mut data = Vec::new();
    ciborium::ser::into_writer(value, &mut data)
        .map_err(|e| CoreError::invalid_state(name, e.to_string()))?;
    store.save(name, &data)
}

/// In-memory state store for tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, name: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(name).cloned())
    }

    fn save(&self, name: &str, data: &[u8]) -> CoreResult<()> {
        self.blobs.write().insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn cbor_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(load_cbor::<BTreeSet<u64>>(&store, "x").unwrap().is_none());

        let value: BTreeSet<u64> = [3, 1, 2].into_iter().collect();
        save_cbor(&store, "x", &value).unwrap();
        assert_eq!(load_cbor::<BTreeSet<u64>>(&store, "x").unwrap(), Some(value));
    }

    #[test]
    fn corrupt_blob_is_an_error() {
        let store = MemoryStateStore::new();
        store.save("x", &[0xff, 0xff]).unwrap();
        let err = load_cbor::<BTreeSet<u64>>(&store, "x").unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }
}
