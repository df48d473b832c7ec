//! Storage trait definition.

use crate::error::StorageResult;
use std::fmt::Debug;
use std::path::Path;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    /// File or directory name (last path component).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

impl DirEntry {
    /// Creates a file entry.
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
        }
    }

    /// Creates a directory entry.
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
        }
    }
}

/// A path-addressed byte store.
///
/// Storage implementations are **opaque**. They read and write bytes at
/// paths; foldsync owns every file format.
///
/// # Invariants
///
/// - Writes are durable when the call returns
/// - `write_new` never replaces an existing file
/// - `replace_atomic` is all-or-nothing: readers see the old or the new bytes
/// - `rename` of a directory is atomic with respect to `list_dir`
/// - `remove_*` succeed when the target is already absent
/// - `list_dir` of a missing directory returns an empty listing
///
/// # Implementors
///
/// - [`super::LocalStorage`] - OS filesystem
/// - [`super::MemoryStorage`] - For testing
pub trait Storage: Send + Sync + Debug {
    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file does not exist.
    fn read(&self, path: &Path) -> StorageResult<Vec<u8>>;

    /// Creates a file that does not exist yet and writes `data` to it.
    ///
    /// Parent directories are created as needed. Of two callers creating the
    /// same path, exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a file or directory is already at `path`.
    fn write_new(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Overwrites bytes of an existing file in place, starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `WritePastEnd` if the write would extend the file.
    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends `data` to a file, creating it (and its parents) if needed.
    fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Replaces the file contents atomically (write temp, sync, rename).
    fn replace_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()>;

    /// Lists a directory, sorted by name.
    fn list_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>>;

    /// Returns true if a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Returns true if a directory exists at `path`.
    fn is_dir(&self, path: &Path) -> bool;

    /// Creates a directory and all of its parents.
    fn create_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Removes a file.
    fn remove_file(&self, path: &Path) -> StorageResult<()>;

    /// Removes a directory and everything below it.
    fn remove_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Renames a file or directory.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if `to` names an existing directory.
    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()>;
}

/// Recursively copies the tree at `from` into `to`.
///
/// `filter` is called with each file's name and bytes; files for which it
/// returns false are skipped. Returns the number of files copied.
pub fn copy_tree<S, F>(storage: &S, from: &Path, to: &Path, filter: &F) -> StorageResult<usize>
where
    S: Storage + ?Sized,
    F: Fn(&str, &[u8]) -> bool,
{
    storage.create_dir_all(to)?;
    let mut copied = 0;
    for entry in storage.list_dir(from)? {
        let src = from.join(&entry.name);
        let dst = to.join(&entry.name);
        if entry.is_dir {
            copied += copy_tree(storage, &src, &dst, filter)?;
            continue;
        }
        let data = match storage.read(&src) {
            Ok(data) => data,
            // Vanished between listing and read (owner garbage-collected it).
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if filter(&entry.name, &data) {
            storage.write_new(&dst, &data)?;
            copied += 1;
        }
    }
    Ok(copied)
}
