//! CLI command implementations.

pub mod activity;
pub mod inspect;
pub mod moves;
pub mod pack;
pub mod verify;

use foldsync_core::{DocumentId, StorageRoot};
use foldsync_storage::Storage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the commands themselves.
#[derive(Debug, Error)]
pub enum CliError {
    /// The directory carries no root identity file.
    #[error("no storage root found at {0:?}")]
    NotARoot(PathBuf),

    /// The requested document has no directory in the root.
    #[error("document {0} not found in the root")]
    UnknownDocument(String),

    /// `--format` named something other than text or json.
    #[error("unknown output format {0:?} (expected text or json)")]
    UnknownFormat(String),

    /// Verification found malformed files.
    #[error("verification failed: {0} malformed file(s)")]
    VerifyFailed(usize),
}

/// Output format shared by the reporting commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(name: &str) -> Result<Self, CliError> {
        match name {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

/// Opens an existing root without initializing it.
pub fn open_root(storage: &dyn Storage, path: &Path) -> Result<StorageRoot, Box<dyn std::error::Error>> {
    StorageRoot::open(storage, path)?
        .ok_or_else(|| CliError::NotARoot(path.to_path_buf()).into())
}

/// The documents of `root`, or just `only` when given.
pub fn select_documents(
    storage: &dyn Storage,
    root: &StorageRoot,
    only: Option<&str>,
) -> Result<Vec<DocumentId>, Box<dyn std::error::Error>> {
    let all = root.list_documents(storage)?;
    match only {
        None => Ok(all),
        Some(name) => {
            let wanted = DocumentId::parse(name)?;
            if all.contains(&wanted) {
                Ok(vec![wanted])
            } else {
                Err(CliError::UnknownDocument(name.to_string()).into())
            }
        }
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldsync_storage::MemoryStorage;

    #[test]
    fn format_names() {
        assert_eq!(Format::parse("json").unwrap(), Format::Json);
        assert_eq!(Format::parse("text").unwrap(), Format::Text);
        assert!(matches!(
            Format::parse("yaml"),
            Err(CliError::UnknownFormat(_))
        ));
    }

    #[test]
    fn plain_directory_is_not_a_root() {
        let storage = MemoryStorage::new();
        storage.create_dir_all(Path::new("/plain")).unwrap();
        assert!(open_root(&storage, Path::new("/plain")).is_err());
        StorageRoot::open_or_init(&storage, Path::new("/plain")).unwrap();
        assert!(open_root(&storage, Path::new("/plain")).is_ok());
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }
}
