//! Sloppy file synchronization between devices.
//!
//! Each device has its own [`MemoryStorage`]. A [`SyncLink`] mirrors one
//! directory tree from one device to another the way a cloud sync client
//! does: file by file, in whatever order the test chooses, possibly handing
//! over a prefix of a file that is still growing. Deletions are never
//! propagated, which is the worst case for readers.

use foldsync_storage::{MemoryStorage, Storage, StorageResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One file that differs between the two sides of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Path of the file (identical on both devices).
    pub path: PathBuf,
    /// Size of the file on the sending device.
    pub len: usize,
}

/// One-way mirror of the tree under `base` from one device to another.
#[derive(Debug, Clone)]
pub struct SyncLink {
    from: Arc<MemoryStorage>,
    to: Arc<MemoryStorage>,
    base: PathBuf,
}

impl SyncLink {
    /// Creates a link mirroring `base` from `from` to `to`.
    pub fn new(from: Arc<MemoryStorage>, to: Arc<MemoryStorage>, base: impl Into<PathBuf>) -> Self {
        Self {
            from,
            to,
            base: base.into(),
        }
    }

    /// The opposite direction over the same tree.
    pub fn reversed(&self) -> Self {
        Self::new(self.to.clone(), self.from.clone(), self.base.clone())
    }

    /// Files whose content differs on the receiving side, sorted by path.
    pub fn pending(&self) -> Vec<Transfer> {
        self.from
            .files()
            .into_iter()
            .filter(|path| path.starts_with(&self.base))
            .filter_map(|path| {
                let data = self.from.read(&path).ok()?;
                match self.to.read(&path) {
                    Ok(existing) if existing == data => None,
                    _ => Some(Transfer {
                        len: data.len(),
                        path,
                    }),
                }
            })
            .collect()
    }

    /// Pending transfers whose path contains `needle`.
    pub fn pending_matching(&self, needle: &str) -> Vec<Transfer> {
        self.pending()
            .into_iter()
            .filter(|t| t.path.to_string_lossy().contains(needle))
            .collect()
    }

    /// Copies one file as it is right now on the sending device.
    pub fn transfer(&self, path: &Path) -> StorageResult<()> {
        let data = self.from.read(path)?;
        self.to.replace_atomic(path, &data)
    }

    /// Delivers only the first `len` bytes of a file.
    pub fn transfer_prefix(&self, path: &Path, len: usize) -> StorageResult<()> {
        let data = self.from.read(path)?;
        self.to.replace_atomic(path, &data[..len.min(data.len())])
    }

    /// Copies pending files in the order given by `order`, a list of indices
    /// into [`Self::pending`]. Out-of-range indices are ignored. Returns the
    /// number of files copied.
    pub fn transfer_in_order(&self, order: &[usize]) -> StorageResult<usize> {
        let pending = self.pending();
        let mut copied = 0;
        for &i in order {
            if let Some(transfer) = pending.get(i) {
                self.transfer(&transfer.path)?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Copies everything pending. Returns the number of files copied.
    pub fn sync_all(&self) -> StorageResult<usize> {
        let pending = self.pending();
        for transfer in &pending {
            self.transfer(&transfer.path)?;
        }
        Ok(pending.len())
    }
}

/// Two devices mirroring the same tree in both directions.
#[derive(Debug, Clone)]
pub struct DevicePair {
    /// First device.
    pub a: Arc<MemoryStorage>,
    /// Second device.
    pub b: Arc<MemoryStorage>,
    base: PathBuf,
}

impl DevicePair {
    /// Two empty devices sharing `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            a: Arc::new(MemoryStorage::new()),
            b: Arc::new(MemoryStorage::new()),
            base: base.into(),
        }
    }

    /// Link from `a` to `b`.
    pub fn a_to_b(&self) -> SyncLink {
        SyncLink::new(self.a.clone(), self.b.clone(), self.base.clone())
    }

    /// Link from `b` to `a`.
    pub fn b_to_a(&self) -> SyncLink {
        self.a_to_b().reversed()
    }

    /// Syncs both directions until nothing is pending.
    pub fn settle(&self) -> StorageResult<()> {
        loop {
            let moved = self.a_to_b().sync_all()? + self.b_to_a().sync_all()?;
            if moved == 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_lists_changed_files_under_base() {
        let pair = DevicePair::new("/cloud");
        pair.a.write_new(Path::new("/cloud/x"), b"1").unwrap();
        pair.a.write_new(Path::new("/cloud/y"), b"2").unwrap();
        pair.a.write_new(Path::new("/local/z"), b"3").unwrap();
        pair.b.write_new(Path::new("/cloud/y"), b"2").unwrap();

        let link = pair.a_to_b();
        let pending = link.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, PathBuf::from("/cloud/x"));
    }

    #[test]
    fn prefix_then_full_transfer() {
        let pair = DevicePair::new("/cloud");
        let path = Path::new("/cloud/log");
        pair.a.write_new(path, b"line one\nline two\n").unwrap();
        let link = pair.a_to_b();

        link.transfer_prefix(path, 12).unwrap();
        assert_eq!(pair.b.read(path).unwrap(), b"line one\nlin");
        assert_eq!(link.pending().len(), 1);
        link.transfer(path).unwrap();
        assert!(link.pending().is_empty());
    }

    #[test]
    fn settle_mirrors_both_ways() {
        let pair = DevicePair::new("/cloud");
        pair.a.write_new(Path::new("/cloud/a"), b"a").unwrap();
        pair.b.write_new(Path::new("/cloud/b"), b"b").unwrap();
        pair.settle().unwrap();
        assert!(pair.a.exists(Path::new("/cloud/b")));
        assert!(pair.b.exists(Path::new("/cloud/a")));
    }
}
