//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The file has no bytes at all (not even the flag byte).
    #[error("file is empty")]
    Empty,

    /// The completion flag is still the draft value; the writer has not
    /// finished. Callers treat this as "retry later", never as corruption.
    #[error("file is incomplete (draft flag)")]
    Incomplete,

    /// The completion flag is neither draft nor complete.
    #[error("invalid completion flag: {0:#04x}")]
    InvalidFlag(u8),

    /// Failed to encode a body.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a body.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// LZ4 decompression failed.
    #[error("decompression failed: {message}")]
    DecompressionFailed {
        /// Description of the decompression error.
        message: String,
    },

    /// A file name does not follow any known grammar.
    #[error("invalid file name: {name}")]
    InvalidFileName {
        /// The offending name.
        name: String,
    },

    /// An identifier cannot be embedded in a file name.
    #[error("invalid identifier for file name: {id}")]
    InvalidIdentifier {
        /// The offending identifier.
        id: String,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Create a decompression failed error.
    pub fn decompression_failed(message: impl Into<String>) -> Self {
        Self::DecompressionFailed {
            message: message.into(),
        }
    }

    /// Create an invalid file name error.
    pub fn invalid_file_name(name: impl Into<String>) -> Self {
        Self::InvalidFileName { name: name.into() }
    }

    /// Returns true if the error only means "not finished writing yet".
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete | CodecError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_classification() {
        assert!(CodecError::Incomplete.is_incomplete());
        assert!(CodecError::Empty.is_incomplete());
        assert!(!CodecError::InvalidFlag(7).is_incomplete());
        assert!(!CodecError::decoding_failed("bad").is_incomplete());
    }

    #[test]
    fn flag_display_is_hex() {
        assert_eq!(
            CodecError::InvalidFlag(0x07).to_string(),
            "invalid completion flag: 0x07"
        );
    }
}
