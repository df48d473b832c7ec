//! OS filesystem storage.

use crate::error::{StorageError, StorageResult};
use crate::storage::{DirEntry, Storage};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Suffix for temporary files written by [`Storage::replace_atomic`].
const TEMP_SUFFIX: &str = ".tmp";

/// Storage backed by the OS filesystem.
///
/// # Durability
///
/// - Every write ends with `File::sync_all()`
/// - Creations, renames and removals fsync the parent directory on Unix
///
/// Paths are used as given; callers pass absolute paths built from a root,
/// never paths that are joined a second time.
///
/// # Example
///
/// ```no_run
/// use foldsync_storage::{LocalStorage, Storage};
/// use std::path::Path;
///
/// let storage = LocalStorage::new();
/// storage.write_new(Path::new("/tmp/foldsync/a.bin"), b"persistent").unwrap();
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl LocalStorage {
    /// Creates a new filesystem storage handle.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Syncs a directory so entry creation/removal is durable.
    ///
    /// Windows NTFS journals metadata, so the explicit fsync is skipped there.
    #[cfg(unix)]
    fn sync_dir(path: &Path) -> StorageResult<()> {
        if let Ok(dir) = File::open(path) {
            dir.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(_path: &Path) -> StorageResult<()> {
        Ok(())
    }

    fn sync_parent(path: &Path) -> StorageResult<()> {
        match path.parent() {
            Some(parent) => Self::sync_dir(parent),
            None => Ok(()),
        }
    }

    fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::from_io(e, parent))?;
        }
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(TEMP_SUFFIX);
        path.with_file_name(name)
    }
}

impl Storage for LocalStorage {
    fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        if path.is_dir() {
            return Err(StorageError::WrongNodeType(path.to_path_buf()));
        }
        fs::read(path).map_err(|e| StorageError::from_io(e, path))
    }

    fn write_new(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        Self::ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| StorageError::from_io(e, path))?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        Self::sync_parent(path)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StorageError::from_io(e, path))?;
        let size = file.metadata()?.len();
        let end = offset.saturating_add(data.len() as u64);
        if end > size {
            return Err(StorageError::WritePastEnd {
                path: path.to_path_buf(),
                offset,
                size,
            });
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        Self::ensure_parent(path)?;
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StorageError::from_io(e, path))?;
        file.write_all(data)?;
        file.sync_all()?;
        if !existed {
            Self::sync_parent(path)?;
        }
        Ok(())
    }

    fn replace_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        Self::ensure_parent(path)?;
        let temp = Self::temp_path(path);

        let mut file = File::create(&temp).map_err(|e| StorageError::from_io(e, &temp))?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, path).map_err(|e| StorageError::from_io(e, path))?;
        Self::sync_parent(path)
    }

    fn list_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>> {
        let iter = match fs::read_dir(path) {
            Ok(iter) => iter,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::from_io(e, path)),
        };

        let mut entries = Vec::new();
        for entry in iter {
            let entry = entry?;
            // Non-UTF-8 names are never produced by foldsync; ignore them.
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let is_dir = entry.file_type()?.is_dir();
            entries.push(DirEntry { name, is_dir });
        }
        entries.sort();
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        fs::create_dir_all(path).map_err(|e| StorageError::from_io(e, path))
    }

    fn remove_file(&self, path: &Path) -> StorageResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Self::sync_parent(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, path)),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Self::sync_parent(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        if to.is_dir() {
            return Err(StorageError::AlreadyExists(to.to_path_buf()));
        }
        Self::ensure_parent(to)?;
        fs::rename(from, to).map_err(|e| StorageError::from_io(e, from))?;
        Self::sync_parent(to)?;
        if from.parent() != to.parent() {
            Self::sync_parent(from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("a.bin");
        let storage = LocalStorage::new();

        storage.write_new(&path, b"hello").unwrap();
        assert_eq!(storage.read(&path).unwrap(), b"hello");
    }

    #[test]
    fn write_new_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("SD_ID");
        let storage = LocalStorage::new();

        storage.write_new(&path, b"first").unwrap();
        assert!(matches!(
            storage.write_new(&path, b"second"),
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(storage.read(&path).unwrap(), b"first");
    }

    #[test]
    fn read_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new();

        let err = storage.read(&dir.path().join("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn write_at_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flag.bin");
        let storage = LocalStorage::new();

        storage.write_new(&path, &[0x00, 1, 2, 3]).unwrap();
        storage.write_at(&path, 0, &[0x01]).unwrap();
        assert_eq!(storage.read(&path).unwrap(), vec![0x01, 1, 2, 3]);
    }

    #[test]
    fn write_at_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let storage = LocalStorage::new();

        storage.write_new(&path, b"ab").unwrap();
        let result = storage.write_at(&path, 1, b"xyz");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn append_creates_and_extends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log").join("a.log");
        let storage = LocalStorage::new();

        storage.append(&path, b"one\n").unwrap();
        storage.append(&path, b"two\n").unwrap();
        assert_eq!(storage.read(&path).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn replace_atomic_leaves_no_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.cbor");
        let storage = LocalStorage::new();

        storage.replace_atomic(&path, b"v1").unwrap();
        storage.replace_atomic(&path, b"v2").unwrap();

        assert_eq!(storage.read(&path).unwrap(), b"v2");
        let names: Vec<_> = storage
            .list_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["state.cbor".to_string()]);
    }

    #[test]
    fn list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new();
        assert!(storage.list_dir(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn rename_directory() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new();
        let from = dir.path().join(".staging");
        let to = dir.path().join("final");

        storage.write_new(&from.join("f.bin"), b"x").unwrap();
        storage.rename(&from, &to).unwrap();

        assert!(!storage.exists(&from));
        assert_eq!(storage.read(&to.join("f.bin")).unwrap(), b"x");
    }

    #[test]
    fn rename_onto_existing_dir_fails() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        storage.create_dir_all(&from).unwrap();
        storage.create_dir_all(&to).unwrap();

        assert!(matches!(
            storage.rename(&from, &to),
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new();
        let path = dir.path().join("x.bin");

        storage.write_new(&path, b"x").unwrap();
        storage.remove_file(&path).unwrap();
        storage.remove_file(&path).unwrap();
        storage.remove_dir_all(&dir.path().join("none")).unwrap();
    }
}
