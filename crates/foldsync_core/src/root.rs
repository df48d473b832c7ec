//! Storage roots and their directory layout.
//!
//! ```text
//! <root>/
//! ├─ SD_ID                         # RootId, created lazily
//! ├─ notes/
//! │  ├─ <documentId>/
//! │  │  ├─ updates/
//! │  │  ├─ packs/
//! │  │  └─ snapshots/
//! │  └─ .moving_<moveId>/          # staging copy during a move
//! └─ activity/<instanceId>.log
//! ```
//!
//! Directory scans skip names starting with `.`, so staging directories stay
//! invisible to every instance until they are renamed into place.

use crate::error::{CoreError, CoreResult};
use crate::types::{DocumentId, InstanceId, MoveId, RootId, Timestamp};
use foldsync_storage::{Storage, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the root identity file.
pub const ROOT_ID_FILE: &str = "SD_ID";
const NOTES_DIR: &str = "notes";
const ACTIVITY_DIR: &str = "activity";
const UPDATES_DIR: &str = "updates";
const PACKS_DIR: &str = "packs";
const SNAPSHOTS_DIR: &str = "snapshots";
const STAGING_PREFIX: &str = ".moving_";
const MOVE_MARKER: &str = "MOVE";
const ACTIVITY_EXT: &str = ".log";
const ADOPT_ATTEMPTS: u32 = 50;
const ADOPT_BACKOFF: Duration = Duration::from_millis(10);

/// Directories holding one document's data files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDirs {
    base: PathBuf,
}

impl DocumentDirs {
    /// Layout rooted at `base`.
    #[must_use]
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// The document directory itself.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Loose update files.
    #[must_use]
    pub fn updates(&self) -> PathBuf {
        self.base.join(UPDATES_DIR)
    }

    /// Pack files.
    #[must_use]
    pub fn packs(&self) -> PathBuf {
        self.base.join(PACKS_DIR)
    }

    /// Snapshot files.
    #[must_use]
    pub fn snapshots(&self) -> PathBuf {
        self.base.join(SNAPSHOTS_DIR)
    }

    /// Creates the three data directories.
    pub fn create(&self, storage: &dyn Storage) -> CoreResult<()> {
        storage.create_dir_all(&self.updates())?;
        storage.create_dir_all(&self.packs())?;
        storage.create_dir_all(&self.snapshots())?;
        Ok(())
    }
}

/// Marker written into a staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingMarker {
    /// Move the staging directory belongs to.
    pub move_id: MoveId,
    /// Instance that created it.
    pub instance: InstanceId,
    /// Creation time.
    pub created_at: Timestamp,
}

/// A storage root with an adopted identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    id: RootId,
    path: PathBuf,
}

impl StorageRoot {
    /// Opens a root, creating its identity file if there is none.
    ///
    /// The identity file is created exclusively. An instance that loses the
    /// race to create it adopts the winner's identity, so the file never
    /// changes once written.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if an identity file exists but is unreadable.
    pub fn open_or_init(storage: &dyn Storage, path: &Path) -> CoreResult<Self> {
        if let Some(root) = Self::open(storage, path)? {
            return Ok(root);
        }
        Self::init(storage, path)
    }

    fn init(storage: &dyn Storage, path: &Path) -> CoreResult<Self> {
        let candidate = RootId::new();
        storage.create_dir_all(path)?;
        match storage.write_new(&path.join(ROOT_ID_FILE), candidate.as_str().as_bytes()) {
            Ok(()) => {
                tracing::info!(root = %candidate, path = %path.display(), "initialized storage root");
                Ok(Self {
                    id: candidate,
                    path: path.to_path_buf(),
                })
            }
            Err(StorageError::AlreadyExists(_)) => {
                let adopted = Self::adopt(storage, path)?;
                tracing::info!(root = %adopted.id, "adopted root identity written concurrently");
                Ok(adopted)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads an identity another instance has just created.
    fn adopt(storage: &dyn Storage, path: &Path) -> CoreResult<Self> {
        let id_path = path.join(ROOT_ID_FILE);
        for _ in 0..ADOPT_ATTEMPTS {
            match storage.read(&id_path) {
                // Created but not written yet.
                Ok(data) if data.is_empty() => std::thread::sleep(ADOPT_BACKOFF),
                _ => break,
            }
        }
        Self::open(storage, path)?
            .ok_or_else(|| CoreError::invalid_state(ROOT_ID_FILE, "vanished after create"))
    }

    /// Opens a root that already has an identity.
    pub fn open(storage: &dyn Storage, path: &Path) -> CoreResult<Option<Self>> {
        let id_path = path.join(ROOT_ID_FILE);
        let data = match storage.read(&id_path) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8(data)
            .map_err(|e| CoreError::invalid_state(ROOT_ID_FILE, e.to_string()))?;
        let id = RootId::parse(text.trim())
            .map_err(|e| CoreError::invalid_state(ROOT_ID_FILE, e.to_string()))?;
        Ok(Some(Self {
            id,
            path: path.to_path_buf(),
        }))
    }

    /// Wraps a known root without touching storage.
    #[must_use]
    pub fn known(id: RootId, path: PathBuf) -> Self {
        Self { id, path }
    }

    /// The root identity.
    #[must_use]
    pub fn id(&self) -> &RootId {
        &self.id
    }

    /// Informational path of the root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the root is reachable and still carries this identity.
    pub fn is_reachable(&self, storage: &dyn Storage) -> bool {
        matches!(Self::open(storage, &self.path), Ok(Some(root)) if root.id == self.id)
    }

    fn notes_dir(&self) -> PathBuf {
        self.path.join(NOTES_DIR)
    }

    /// Visible directory of a document.
    #[must_use]
    pub fn document(&self, document: &DocumentId) -> DocumentDirs {
        DocumentDirs::new(self.notes_dir().join(document.as_str()))
    }

    /// Hidden staging directory of a move.
    #[must_use]
    pub fn staging(&self, move_id: &MoveId) -> DocumentDirs {
        DocumentDirs::new(
            self.notes_dir()
                .join(format!("{STAGING_PREFIX}{}", move_id.as_str())),
        )
    }

    /// Path of the marker inside a staging directory.
    #[must_use]
    pub fn staging_marker(&self, move_id: &MoveId) -> PathBuf {
        self.staging(move_id).base().join(MOVE_MARKER)
    }

    /// Reads a staging marker, if present and decodable.
    pub fn read_staging_marker(
        &self,
        storage: &dyn Storage,
        move_id: &MoveId,
    ) -> Option<StagingMarker> {
        let data = storage.read(&self.staging_marker(move_id)).ok()?;
        ciborium::de::from_reader(data.as_slice()).ok()
    }

    /// Writes a staging marker.
    pub fn write_staging_marker(
        &self,
        storage: &dyn Storage,
        marker: &StagingMarker,
    ) -> CoreResult<()> {
        let mut data = Vec::new();
        ciborium::ser::into_writer(marker, &mut data)
            .map_err(|e| CoreError::invalid_state(MOVE_MARKER, e.to_string()))?;
        storage.replace_atomic(&self.staging_marker(&marker.move_id), &data)?;
        Ok(())
    }

    /// Activity log directory.
    #[must_use]
    pub fn activity_dir(&self) -> PathBuf {
        self.path.join(ACTIVITY_DIR)
    }

    /// Activity log of one instance.
    #[must_use]
    pub fn activity_log(&self, instance: &InstanceId) -> PathBuf {
        self.activity_dir()
            .join(format!("{}{ACTIVITY_EXT}", instance.as_str()))
    }

    /// Lists instances that have an activity log in this root.
    pub fn list_activity_logs(&self, storage: &dyn Storage) -> CoreResult<Vec<InstanceId>> {
        let mut instances = Vec::new();
        for entry in storage.list_dir(&self.activity_dir())? {
            if entry.is_dir {
                continue;
            }
            if let Some(stem) = entry.name.strip_suffix(ACTIVITY_EXT) {
                if let Ok(instance) = InstanceId::parse(stem) {
                    instances.push(instance);
                }
            }
        }
        Ok(instances)
    }

    /// Lists visible document directories.
    pub fn list_documents(&self, storage: &dyn Storage) -> CoreResult<Vec<DocumentId>> {
        let mut documents = Vec::new();
        for entry in storage.list_dir(&self.notes_dir())? {
            if !entry.is_dir || entry.name.starts_with('.') {
                continue;
            }
            match DocumentId::parse(&entry.name) {
                Ok(id) => documents.push(id),
                Err(_) => tracing::debug!(name = %entry.name, "ignoring foreign directory"),
            }
        }
        Ok(documents)
    }

    /// Lists staging directories by move id.
    pub fn list_staging(&self, storage: &dyn Storage) -> CoreResult<Vec<MoveId>> {
        let mut moves = Vec::new();
        for entry in storage.list_dir(&self.notes_dir())? {
            if !entry.is_dir {
                continue;
            }
            if let Some(id) = entry.name.strip_prefix(STAGING_PREFIX) {
                if let Ok(move_id) = MoveId::parse(id) {
                    moves.push(move_id);
                }
            }
        }
        Ok(moves)
    }
}

/// Registered roots of one instance.
///
/// An instance only touches roots it has registered; a root that is
/// registered but whose identity file cannot be read is inaccessible.
#[derive(Debug, Default)]
pub struct RootRegistry {
    roots: RwLock<BTreeMap<RootId, StorageRoot>>,
}

impl RootRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a root, replacing a previous path for the same id.
    pub fn insert(&self, root: StorageRoot) {
        self.roots.write().insert(root.id.clone(), root);
    }

    /// Returns a registered root.
    #[must_use]
    pub fn get(&self, id: &RootId) -> Option<StorageRoot> {
        self.roots.read().get(id).cloned()
    }

    /// Returns a root if it is registered and reachable.
    pub fn accessible(&self, storage: &dyn Storage, id: &RootId) -> Option<StorageRoot> {
        self.get(id).filter(|root| root.is_reachable(storage))
    }

    /// Like [`Self::accessible`] but as an error.
    pub fn require(&self, storage: &dyn Storage, id: &RootId) -> CoreResult<StorageRoot> {
        self.accessible(storage, id)
            .ok_or_else(|| CoreError::root_not_accessible(id))
    }

    /// All registered roots.
    #[must_use]
    pub fn all(&self) -> Vec<StorageRoot> {
        self.roots.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldsync_storage::MemoryStorage;

    #[test]
    fn identity_is_created_once() {
        let storage = MemoryStorage::new();
        let first = StorageRoot::open_or_init(&storage, Path::new("/r1")).unwrap();
        let second = StorageRoot::open_or_init(&storage, Path::new("/r1")).unwrap();
        assert_eq!(first.id(), second.id());
        assert!(first.is_reachable(&storage));
    }

    #[test]
    fn racing_writer_is_adopted() {
        let storage = MemoryStorage::new();
        let winner = RootId::parse("winner").unwrap();
        storage
            .write_new(Path::new("/r1/SD_ID"), b"winner\n")
            .unwrap();
        let root = StorageRoot::open_or_init(&storage, Path::new("/r1")).unwrap();
        assert_eq!(root.id(), &winner);
    }

    #[test]
    fn late_initializer_adopts_existing_identity() {
        let storage = MemoryStorage::new();
        // Y looked for SD_ID and found none, then X initialized the root.
        let x = StorageRoot::open_or_init(&storage, Path::new("/r1")).unwrap();
        let y = StorageRoot::init(&storage, Path::new("/r1")).unwrap();

        assert_eq!(y.id(), x.id());
        assert!(x.is_reachable(&storage));
        assert!(y.is_reachable(&storage));
    }

    #[test]
    fn concurrent_initializers_agree_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root");
        let storage = foldsync_storage::LocalStorage::new();

        let ids: Vec<RootId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| StorageRoot::init(&storage, &path).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().id().clone())
                .collect()
        });

        let on_disk = StorageRoot::open(&storage, &path).unwrap().unwrap();
        assert!(ids.iter().all(|id| id == on_disk.id()));
    }

    #[test]
    fn unreadable_identity_is_an_error() {
        let storage = MemoryStorage::new();
        storage.write_new(Path::new("/r1/SD_ID"), b"a_b").unwrap();
        assert!(StorageRoot::open_or_init(&storage, Path::new("/r1")).is_err());
    }

    #[test]
    fn scans_skip_staging_and_foreign_dirs() {
        let storage = MemoryStorage::new();
        let root = StorageRoot::open_or_init(&storage, Path::new("/r")).unwrap();
        let doc = DocumentId::parse("doc-1").unwrap();
        let move_id = MoveId::parse("m1").unwrap();

        root.document(&doc).create(&storage).unwrap();
        root.staging(&move_id).create(&storage).unwrap();
        storage
            .create_dir_all(Path::new("/r/notes/not_an_id"))
            .unwrap();

        assert_eq!(root.list_documents(&storage).unwrap(), vec![doc]);
        assert_eq!(root.list_staging(&storage).unwrap(), vec![move_id]);
    }

    #[test]
    fn staging_marker_roundtrip() {
        let storage = MemoryStorage::new();
        let root = StorageRoot::open_or_init(&storage, Path::new("/r")).unwrap();
        let marker = StagingMarker {
            move_id: MoveId::parse("m1").unwrap(),
            instance: InstanceId::parse("inst-a").unwrap(),
            created_at: 42,
        };
        root.write_staging_marker(&storage, &marker).unwrap();
        assert_eq!(
            root.read_staging_marker(&storage, &marker.move_id),
            Some(marker)
        );
    }

    #[test]
    fn registry_tracks_reachability() {
        let storage = MemoryStorage::new();
        let registry = RootRegistry::new();
        let root = StorageRoot::open_or_init(&storage, Path::new("/r")).unwrap();
        registry.insert(root.clone());
        assert!(registry.accessible(&storage, root.id()).is_some());

        storage.remove_dir_all(Path::new("/r")).unwrap();
        assert!(registry.accessible(&storage, root.id()).is_none());
        assert!(matches!(
            registry.require(&storage, root.id()),
            Err(CoreError::RootNotAccessible { .. })
        ));
    }
}
