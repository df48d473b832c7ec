//! Line codec for activity log files.
//!
//! One JSON object per `\n`-terminated line. A trailing fragment without a
//! newline is a line still being written (or still being synced) and is not
//! returned until its newline arrives.

use crate::error::{CodecError, CodecResult};
use serde::{Deserialize, Serialize};

/// Kind of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A document was created in the root.
    Created,
    /// New update files were written for the document.
    Updated,
    /// The document was moved into the root.
    Moved,
}

/// One activity log record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLine {
    /// Document the event concerns.
    pub document_id: String,
    /// Root the document lives in after the event.
    pub root_id: String,
    /// Event kind.
    pub kind: ActivityKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ActivityLine {
    /// Encodes the record as one newline-terminated line.
    pub fn encode_line(&self) -> CodecResult<Vec<u8>> {
        let mut line =
            serde_json::to_vec(self).map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decodes one line (without its terminator).
    pub fn decode_line(line: &[u8]) -> CodecResult<Self> {
        serde_json::from_slice(line).map_err(|e| CodecError::decoding_failed(e.to_string()))
    }
}

/// Splits raw log bytes into complete lines.
///
/// Returns the complete lines (terminators stripped) and the byte length they
/// occupy. Bytes after the last `\n` are left for a later read.
#[must_use]
pub fn complete_lines(bytes: &[u8]) -> (Vec<&[u8]>, usize) {
    let Some(last_newline) = bytes.iter().rposition(|&b| b == b'\n') else {
        return (Vec::new(), 0);
    };
    let consumed = last_newline + 1;
    let lines = bytes[..last_newline].split(|&b| b == b'\n').collect();
    (lines, consumed)
}
