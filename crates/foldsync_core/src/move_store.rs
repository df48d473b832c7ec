//! Persistence of move records.
//!
//! Records live outside every storage root so a move can be resumed no
//! matter which roots are currently reachable. [`FileMoveStore`] keeps one
//! CBOR file per move, which lets every instance on a machine see the
//! records of the others.

use crate::dir::write_atomic;
use crate::error::{CoreError, CoreResult};
use crate::moves::MoveRecord;
use crate::types::{DocumentId, InstanceId, MoveId, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

const RECORD_EXT: &str = ".cbor";

/// Durable table of move records.
pub trait MoveStore: Send + Sync + Debug {
    /// Loads one record.
    fn load(&self, move_id: &MoveId) -> CoreResult<Option<MoveRecord>>;

    /// Inserts or replaces a record atomically.
    fn save(&self, record: &MoveRecord) -> CoreResult<()>;

    /// Deletes a record. Deleting an absent record is not an error.
    fn remove(&self, move_id: &MoveId) -> CoreResult<()>;

    /// All records, ordered by move id.
    fn list(&self) -> CoreResult<Vec<MoveRecord>>;

    /// Records concerning one document.
    fn for_document(&self, document: &DocumentId) -> CoreResult<Vec<MoveRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| &r.document_id == document)
            .collect())
    }

    /// Records not yet in a terminal state.
    fn active(&self) -> CoreResult<Vec<MoveRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect())
    }

    /// Active records of other instances that stopped making progress.
    fn stale_foreign(
        &self,
        own: &InstanceId,
        now: Timestamp,
        stale_after: Duration,
    ) -> CoreResult<Vec<MoveRecord>> {
        Ok(self
            .active()?
            .into_iter()
            .filter(|r| &r.initiating_instance != own && r.is_stale(now, stale_after))
            .collect())
    }
}

/// Move store backed by a local directory.
#[derive(Debug)]
pub struct FileMoveStore {
    dir: PathBuf,
}

impl FileMoveStore {
    /// Opens (and creates) the store directory.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn file_name(move_id: &MoveId) -> String {
        format!("{}{RECORD_EXT}", move_id.as_str())
    }

    fn decode(name: &str, data: &[u8]) -> CoreResult<MoveRecord> {
        ciborium::de::from_reader(data).map_err(|e| CoreError::invalid_state(name, e.to_string()))
    }
}

impl MoveStore for FileMoveStore {
    fn load(&self, move_id: &MoveId) -> CoreResult<Option<MoveRecord>> {
        let name = Self::file_name(move_id);
        match fs::read(self.dir.join(&name)) {
            Ok(data) => Self::decode(&name, &data).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, record: &MoveRecord) -> CoreResult<()> {
        let name = Self::file_name(&record.move_id);
        let mut data = Vec::new();
        ciborium::ser::into_writer(record, &mut data)
            .map_err(|e| CoreError::invalid_state(&name, e.to_string()))?;
        write_atomic(&self.dir, &name, &data)
    }

    fn remove(&self, move_id: &MoveId) -> CoreResult<()> {
        match fs::remove_file(self.dir.join(Self::file_name(move_id))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> CoreResult<Vec<MoveRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(RECORD_EXT) {
                continue;
            }
            let data = match fs::read(entry.path()) {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match Self::decode(&name, &data) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(file = %name, error = %e, "skipping unreadable move record"),
            }
        }
        records.sort_by(|a, b| a.move_id.cmp(&b.move_id));
        Ok(records)
    }
}

/// In-memory move store for tests.
#[derive(Debug, Default)]
pub struct MemoryMoveStore {
    records: RwLock<BTreeMap<MoveId, MoveRecord>>,
}

impl MemoryMoveStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MoveStore for MemoryMoveStore {
    fn load(&self, move_id: &MoveId) -> CoreResult<Option<MoveRecord>> {
        Ok(self.records.read().get(move_id).cloned())
    }

    fn save(&self, record: &MoveRecord) -> CoreResult<()> {
        self.records
            .write()
            .insert(record.move_id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, move_id: &MoveId) -> CoreResult<()> {
        self.records.write().remove(move_id);
        Ok(())
    }

    fn list(&self) -> CoreResult<Vec<MoveRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }
}
