//! Completion-flag envelope shared by update, pack and snapshot files.
//!
//! Every data file starts with one reserved byte:
//!
//! ```text
//! ┌──────┬──────────────────────────────┐
//! │ flag │ payload                      │
//! └──────┴──────────────────────────────┘
//!   0x00   while the writer is still writing
//!   0x01   only after the payload is fully persisted
//! ```
//!
//! A cloud-sync client may upload a file half-written. The flag lets readers
//! tell "not finished yet" apart from "corrupt": a reader that sees `0x00`
//! skips the file and tries again later.

use crate::error::{CodecError, CodecResult};

/// Flag value while the payload is being written.
pub const FLAG_DRAFT: u8 = 0x00;

/// Flag value once the payload is durable.
pub const FLAG_COMPLETE: u8 = 0x01;

/// Length of the envelope header.
pub const FLAG_LEN: usize = 1;

/// Completion state of a stored file, judged from its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// Zero-length file.
    Empty,
    /// Flag is `0x00`.
    Draft,
    /// Flag is `0x01`.
    Complete,
    /// Any other flag value.
    Invalid(u8),
}

impl FileState {
    /// Classifies raw file bytes.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        match bytes.first() {
            None => FileState::Empty,
            Some(&FLAG_DRAFT) => FileState::Draft,
            Some(&FLAG_COMPLETE) => FileState::Complete,
            Some(&other) => FileState::Invalid(other),
        }
    }
}

/// Builds the draft image of a file: `FLAG_DRAFT` followed by `payload`.
///
/// The writer persists this image, then flips the first byte to
/// [`FLAG_COMPLETE`].
#[must_use]
pub fn draft(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(FLAG_LEN + payload.len());
    data.push(FLAG_DRAFT);
    data.extend_from_slice(payload);
    data
}

/// Builds the completed image of a file in one piece.
///
/// Only for copies of already-complete files and for tests; fresh writes go
/// through [`draft`] plus a flag flip.
#[must_use]
pub fn complete(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(FLAG_LEN + payload.len());
    data.push(FLAG_COMPLETE);
    data.extend_from_slice(payload);
    data
}

/// Returns the payload of a complete file, stripping the flag byte.
///
/// # Errors
///
/// - [`CodecError::Empty`] for a zero-length file
/// - [`CodecError::Incomplete`] if the flag is still the draft value
/// - [`CodecError::InvalidFlag`] for any other flag value
pub fn payload(bytes: &[u8]) -> CodecResult<&[u8]> {
    match FileState::of(bytes) {
        FileState::Complete => Ok(&bytes[FLAG_LEN..]),
        FileState::Empty => Err(CodecError::Empty),
        FileState::Draft => Err(CodecError::Incomplete),
        FileState::Invalid(flag) => Err(CodecError::InvalidFlag(flag)),
    }
}
