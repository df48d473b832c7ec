//! Error types for foldsync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in foldsync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] foldsync_storage::StorageError),

    /// File format error.
    #[error("codec error: {0}")]
    Codec(#[from] foldsync_codec::CodecError),

    /// I/O error on the instance state directory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// State directory is held by another engine.
    #[error("state directory locked: another process has exclusive access")]
    StateLocked,

    /// A persisted state file could not be read back.
    #[error("invalid state file {name}: {message}")]
    InvalidState {
        /// State file name.
        name: String,
        /// Description of the problem.
        message: String,
    },

    /// A data file did not match what its name claims.
    #[error("malformed file {path}: {message}")]
    MalformedFile {
        /// Path of the file.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// The document model rejected an update.
    #[error("document model rejected update: {message}")]
    ApplyFailed {
        /// Message from the document model.
        message: String,
    },

    /// Root is not registered or not reachable from this instance.
    #[error("storage root not accessible: {root_id}")]
    RootNotAccessible {
        /// The root that could not be reached.
        root_id: String,
    },

    /// Document is not in the local index.
    #[error("document not found: {document_id}")]
    DocumentNotFound {
        /// The missing document.
        document_id: String,
    },

    /// Document is not open in this engine.
    #[error("document not open: {document_id}")]
    DocumentNotOpen {
        /// The document.
        document_id: String,
    },

    /// Move record does not exist.
    #[error("move not found: {move_id}")]
    MoveNotFound {
        /// The missing move.
        move_id: String,
    },

    /// Move is owned by another instance.
    #[error("move {move_id} is owned by instance {owner}")]
    MoveNotOwned {
        /// The move.
        move_id: String,
        /// Current owner.
        owner: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid state file error.
    pub fn invalid_state(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a malformed file error.
    pub fn malformed(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::MalformedFile {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Creates an apply failure.
    pub fn apply_failed(message: impl Into<String>) -> Self {
        Self::ApplyFailed {
            message: message.into(),
        }
    }

    /// Creates a root-not-accessible error.
    pub fn root_not_accessible(root_id: impl ToString) -> Self {
        Self::RootNotAccessible {
            root_id: root_id.to_string(),
        }
    }

    /// Creates a document-not-found error.
    pub fn document_not_found(document_id: impl ToString) -> Self {
        Self::DocumentNotFound {
            document_id: document_id.to_string(),
        }
    }

    /// Creates a document-not-open error.
    pub fn document_not_open(document_id: impl ToString) -> Self {
        Self::DocumentNotOpen {
            document_id: document_id.to_string(),
        }
    }

    /// Creates a move-not-found error.
    pub fn move_not_found(move_id: impl ToString) -> Self {
        Self::MoveNotFound {
            move_id: move_id.to_string(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the error concerns one data file only.
    ///
    /// Such errors are logged and the file is skipped; they never abort a
    /// whole load.
    #[must_use]
    pub fn is_file_local(&self) -> bool {
        matches!(
            self,
            CoreError::Codec(_) | CoreError::MalformedFile { .. } | CoreError::ApplyFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldsync_codec::CodecError;
    use foldsync_storage::StorageError;
    use std::path::PathBuf;

    #[test]
    fn error_display() {
        let err = CoreError::malformed("/r/notes/d/packs/x.pack", "range mismatch");
        assert_eq!(
            err.to_string(),
            "malformed file /r/notes/d/packs/x.pack: range mismatch"
        );

        let err = CoreError::StateLocked;
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn conversions() {
        let err: CoreError = StorageError::NotFound(PathBuf::from("/x")).into();
        assert!(matches!(err, CoreError::Storage(_)));

        let err: CoreError = CodecError::Incomplete.into();
        assert!(err.is_file_local());
        assert!(!CoreError::StateLocked.is_file_local());
    }
}
