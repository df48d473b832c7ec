//! Instance state directory.
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK              # Advisory lock, one engine per directory
//! ├─ INSTANCE          # Persisted instance id
//! ├─ index.cbor        # Document index
//! ├─ sequences.cbor    # Last allocated sequence per document
//! ├─ cursors.cbor      # Reader clocks and activity cursors
//! ├─ pending.cbor      # Imports waiting for files
//! └─ roots.cbor        # Registered storage roots
//! ```
//!
//! The directory is never shared: it is what makes an instance an instance.

use crate::error::{CoreError, CoreResult};
use crate::state::StateStore;
use crate::types::InstanceId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const INSTANCE_FILE: &str = "INSTANCE";
const TEMP_SUFFIX: &str = ".tmp";

/// Manages the state directory and its lock.
///
/// Only one `InstanceDir` can exist per directory at a time.
#[derive(Debug)]
pub struct InstanceDir {
    path: PathBuf,
    instance: InstanceId,
    _lock_file: File,
}

impl InstanceDir {
    /// Opens or creates a state directory and locks it.
    ///
    /// A new directory gets a fresh random instance id.
    ///
    /// # Errors
    ///
    /// - `StateLocked` if another process holds the lock
    /// - `InvalidState` if the persisted instance id is unreadable
    pub fn open(path: &Path) -> CoreResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StateLocked);
        }

        let instance = match Self::read_instance_id(path)? {
            Some(id) => id,
            None => {
                let id = InstanceId::new();
                write_atomic(path, INSTANCE_FILE, id.as_str().as_bytes())?;
                tracing::info!(instance = %id, "created new instance identity");
                id
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            instance,
            _lock_file: lock_file,
        })
    }

    /// Reads the instance id of a state directory without locking it.
    pub fn read_instance_id(path: &Path) -> CoreResult<Option<InstanceId>> {
        match fs::read_to_string(path.join(INSTANCE_FILE)) {
            Ok(text) => InstanceId::parse(text.trim())
                .map(Some)
                .map_err(|e| CoreError::invalid_state(INSTANCE_FILE, e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the state directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns this instance's id.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }
}

impl StateStore for InstanceDir {
    fn load(&self, name: &str) -> CoreResult<Option<Vec<u8>>> {
        match fs::read(self.path.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, data: &[u8]) -> CoreResult<()> {
        write_atomic(&self.path, name, data)
    }
}

/// Writes `dir/name` atomically.
///
/// 1. Write to a temporary file
/// 2. Sync the temporary file
/// 3. Rename over the target
/// 4. Fsync the directory so the rename is durable
pub(crate) fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> CoreResult<()> {
    let target = dir.join(name);
    let temp = dir.join(format!("{name}{TEMP_SUFFIX}"));

    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, &target)?;
    sync_directory(dir)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> CoreResult<()> {
    // NTFS journals metadata; directory handles cannot be fsynced.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory_and_identity() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state");

        let dir = InstanceDir::open(&path).unwrap();
        assert!(path.is_dir());
        let id = dir.instance_id().clone();
        drop(dir);

        let reopened = InstanceDir::open(&path).unwrap();
        assert_eq!(reopened.instance_id(), &id);
        assert_eq!(InstanceDir::read_instance_id(&path).unwrap(), Some(id));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = InstanceDir::open(temp.path()).unwrap();
        let second = InstanceDir::open(temp.path());
        assert!(matches!(second, Err(CoreError::StateLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        {
            let _dir = InstanceDir::open(temp.path()).unwrap();
        }
        let _again = InstanceDir::open(temp.path()).unwrap();
    }

    #[test]
    fn state_blobs_persist() {
        let temp = tempdir().unwrap();
        let dir = InstanceDir::open(temp.path()).unwrap();

        assert!(dir.load("index.cbor").unwrap().is_none());
        dir.save("index.cbor", b"one").unwrap();
        dir.save("index.cbor", b"two").unwrap();
        assert_eq!(dir.load("index.cbor").unwrap().unwrap(), b"two");
        assert!(!temp.path().join("index.cbor.tmp").exists());
    }

    #[test]
    fn unreadable_identity_is_reported() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(INSTANCE_FILE), "not_valid").unwrap();
        let err = InstanceDir::open(temp.path()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }
}
