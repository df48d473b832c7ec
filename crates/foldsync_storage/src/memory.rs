//! In-memory storage for testing.

use crate::error::{StorageError, StorageResult};
use crate::storage::{DirEntry, Storage};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// An in-memory path-addressed store.
///
/// Suitable for:
/// - Unit tests
/// - Simulating two replicas that see different subsets of files
///
/// # Thread Safety
///
/// Thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use foldsync_storage::{MemoryStorage, Storage};
/// use std::path::Path;
///
/// let storage = MemoryStorage::new();
/// storage.append(Path::new("/r/log"), b"a").unwrap();
/// storage.append(Path::new("/r/log"), b"b").unwrap();
/// assert_eq!(storage.read(Path::new("/r/log")).unwrap(), b"ab");
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
}

impl MemoryStorage {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every file path currently stored.
    ///
    /// Useful for assertions in tests.
    #[must_use]
    pub fn files(&self) -> Vec<PathBuf> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, node)| matches!(node, Node::File(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn insert_parents(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() {
                break;
            }
            nodes.entry(dir.to_path_buf()).or_insert(Node::Dir);
            current = dir.parent();
        }
    }

    fn subtree_keys(nodes: &BTreeMap<PathBuf, Node>, root: &Path) -> Vec<PathBuf> {
        nodes
            .keys()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        match self.nodes.read().get(path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(StorageError::WrongNodeType(path.to_path_buf())),
            None => Err(StorageError::NotFound(path.to_path_buf())),
        }
    }

    fn write_new(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(path) {
            return Err(StorageError::AlreadyExists(path.to_path_buf()));
        }
        Self::insert_parents(&mut nodes, path);
        nodes.insert(path.to_path_buf(), Node::File(data.to_vec()));
        Ok(())
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(path) {
            Some(Node::File(existing)) => {
                let size = existing.len() as u64;
                let end = offset.saturating_add(data.len() as u64);
                if end > size {
                    return Err(StorageError::WritePastEnd {
                        path: path.to_path_buf(),
                        offset,
                        size,
                    });
                }
                let start = offset as usize;
                existing[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            Some(Node::Dir) => Err(StorageError::WrongNodeType(path.to_path_buf())),
            None => Err(StorageError::NotFound(path.to_path_buf())),
        }
    }

    fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        Self::insert_parents(&mut nodes, path);
        match nodes
            .entry(path.to_path_buf())
            .or_insert_with(|| Node::File(Vec::new()))
        {
            Node::File(existing) => {
                existing.extend_from_slice(data);
                Ok(())
            }
            Node::Dir => Err(StorageError::WrongNodeType(path.to_path_buf())),
        }
    }

    fn replace_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        if let Some(Node::Dir) = nodes.get(path) {
            return Err(StorageError::WrongNodeType(path.to_path_buf()));
        }
        Self::insert_parents(&mut nodes, path);
        nodes.insert(path.to_path_buf(), Node::File(data.to_vec()));
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>> {
        let nodes = self.nodes.read();
        let mut entries: Vec<DirEntry> = nodes
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .filter_map(|(p, node)| {
                let name = p.file_name()?.to_str()?.to_string();
                Some(DirEntry {
                    name,
                    is_dir: matches!(node, Node::Dir),
                })
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        self.nodes.read().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(self.nodes.read().get(path), Some(Node::Dir))
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        if let Some(Node::File(_)) = nodes.get(path) {
            return Err(StorageError::WrongNodeType(path.to_path_buf()));
        }
        Self::insert_parents(&mut nodes, path);
        nodes.insert(path.to_path_buf(), Node::Dir);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        match nodes.get(path) {
            Some(Node::Dir) => Err(StorageError::WrongNodeType(path.to_path_buf())),
            Some(Node::File(_)) => {
                nodes.remove(path);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        for key in Self::subtree_keys(&nodes, path) {
            nodes.remove(&key);
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(from) {
            return Err(StorageError::NotFound(from.to_path_buf()));
        }
        if let Some(Node::Dir) = nodes.get(to) {
            return Err(StorageError::AlreadyExists(to.to_path_buf()));
        }
        Self::insert_parents(&mut nodes, to);
        for key in Self::subtree_keys(&nodes, from) {
            if let Some(node) = nodes.remove(&key) {
                let suffix = key.strip_prefix(from).unwrap_or(Path::new(""));
                let target = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                nodes.insert(target, node);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let storage = MemoryStorage::new();
        storage.write_new(Path::new("/r/a/b.bin"), b"data").unwrap();

        assert_eq!(storage.read(Path::new("/r/a/b.bin")).unwrap(), b"data");
        assert!(storage.is_dir(Path::new("/r/a")));
        assert!(storage.is_dir(Path::new("/r")));
    }

    #[test]
    fn read_missing() {
        let storage = MemoryStorage::new();
        assert!(storage.read(Path::new("/nope")).unwrap_err().is_not_found());
    }

    #[test]
    fn list_dir_direct_children_only() {
        let storage = MemoryStorage::new();
        storage.write_new(Path::new("/r/a.bin"), b"a").unwrap();
        storage.write_new(Path::new("/r/sub/b.bin"), b"b").unwrap();

        let entries = storage.list_dir(Path::new("/r")).unwrap();
        assert_eq!(entries, vec![DirEntry::file("a.bin"), DirEntry::dir("sub")]);
    }

    #[test]
    fn write_at_flips_flag() {
        let storage = MemoryStorage::new();
        let path = Path::new("/r/u.upd");
        storage.write_new(path, &[0, 9, 9]).unwrap();
        storage.write_at(path, 0, &[1]).unwrap();
        assert_eq!(storage.read(path).unwrap(), vec![1, 9, 9]);
    }

    #[test]
    fn rename_moves_subtree() {
        let storage = MemoryStorage::new();
        storage.write_new(Path::new("/r/.stage/x/1"), b"1").unwrap();
        storage.write_new(Path::new("/r/.stage/2"), b"2").unwrap();

        storage
            .rename(Path::new("/r/.stage"), Path::new("/r/final"))
            .unwrap();

        assert!(!storage.exists(Path::new("/r/.stage")));
        assert_eq!(storage.read(Path::new("/r/final/x/1")).unwrap(), b"1");
        assert_eq!(storage.read(Path::new("/r/final/2")).unwrap(), b"2");
    }

    #[test]
    fn rename_missing_source() {
        let storage = MemoryStorage::new();
        let result = storage.rename(Path::new("/a"), Path::new("/b"));
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn remove_dir_all_removes_subtree() {
        let storage = MemoryStorage::new();
        storage.write_new(Path::new("/r/d/1"), b"1").unwrap();
        storage.write_new(Path::new("/r/keep"), b"k").unwrap();

        storage.remove_dir_all(Path::new("/r/d")).unwrap();

        assert_eq!(storage.files(), vec![PathBuf::from("/r/keep")]);
    }
}
