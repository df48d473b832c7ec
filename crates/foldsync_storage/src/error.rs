//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file or directory does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The destination of a create or rename already exists.
    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A write addressed bytes outside the existing file.
    #[error("write beyond end of file {}: offset {offset}, size {size}", .path.display())]
    WritePastEnd {
        /// File being written.
        path: PathBuf,
        /// The requested write offset.
        offset: u64,
        /// The current file size.
        size: u64,
    },

    /// The path names a directory where a file was expected, or vice versa.
    #[error("wrong node type at {}", .0.display())]
    WrongNodeType(PathBuf),
}

impl StorageError {
    /// Returns true if the error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub(crate) fn from_io(err: io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_path_buf()),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_path_buf()),
            _ => StorageError::Io(err),
        }
    }
}
