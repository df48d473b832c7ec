//! CBOR bodies of pack and snapshot files.
//!
//! Bodies are serialized with `ciborium` and optionally compressed with LZ4
//! (size-prepended block format). Whether a body is compressed is carried by
//! the file name, see [`crate::FileName::is_compressed`].
//!
//! The size prefix is checked against the largest LZ4 expansion ratio before
//! anything is allocated.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Largest ratio of decompressed to compressed size an LZ4 block reaches.
const MAX_EXPANSION: usize = 255;

/// One update inside a pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedUpdate {
    /// Sequence number of the update.
    pub seq: u64,
    /// Flush timestamp of the original update file (ms since epoch).
    pub timestamp: u64,
    /// Raw merge-engine update bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Body of a pack file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackBody {
    /// Instance that wrote every update in the pack.
    pub instance_id: String,
    /// Document the pack belongs to.
    pub document_id: String,
    /// First sequence (inclusive).
    pub start: u64,
    /// Last sequence (inclusive).
    pub end: u64,
    /// Updates, ascending by sequence, one per sequence in `start..=end`.
    pub updates: Vec<PackedUpdate>,
}

impl PackBody {
    /// Checks that `updates` covers exactly `start..=end` in order.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DecodingFailed`] describing the first mismatch.
    pub fn validate(&self) -> CodecResult<()> {
        if self.start == 0 || self.end < self.start {
            return Err(CodecError::decoding_failed(format!(
                "pack range {}-{} is invalid",
                self.start, self.end
            )));
        }
        let expected = self.end - self.start + 1;
        if self.updates.len() as u64 != expected {
            return Err(CodecError::decoding_failed(format!(
                "pack {}-{} holds {} updates",
                self.start,
                self.end,
                self.updates.len()
            )));
        }
        for (offset, update) in self.updates.iter().enumerate() {
            let want = self.start + offset as u64;
            if update.seq != want {
                return Err(CodecError::decoding_failed(format!(
                    "pack {}-{} has sequence {} where {} was expected",
                    self.start, self.end, update.seq, want
                )));
            }
        }
        Ok(())
    }
}

/// Body of a snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBody {
    /// Document the snapshot belongs to.
    pub document_id: String,
    /// Encoded full document state.
    #[serde(with = "serde_bytes")]
    pub full_state: Vec<u8>,
    /// Vector clock: every update at or below these sequences is embedded.
    pub max_sequences: BTreeMap<String, u64>,
    /// Sum of `max_sequences`.
    pub total_change_count: u64,
    /// Creation time (ms since epoch).
    pub timestamp: u64,
}

/// Types stored as file bodies.
pub trait Encode {
    /// Encodes to body bytes, compressing when asked.
    fn encode(&self, compress: bool) -> CodecResult<Vec<u8>>;
}

/// Types read back from file bodies.
pub trait Decode: Sized {
    /// Decodes body bytes, decompressing when flagged.
    fn decode(bytes: &[u8], compressed: bool) -> CodecResult<Self>;
}

impl Encode for PackBody {
    fn encode(&self, compress: bool) -> CodecResult<Vec<u8>> {
        encode_body(self, compress)
    }
}

impl Decode for PackBody {
    fn decode(bytes: &[u8], compressed: bool) -> CodecResult<Self> {
        let body: PackBody = decode_body(bytes, compressed)?;
        body.validate()?;
        Ok(body)
    }
}

impl Encode for SnapshotBody {
    fn encode(&self, compress: bool) -> CodecResult<Vec<u8>> {
        encode_body(self, compress)
    }
}

impl Decode for SnapshotBody {
    fn decode(bytes: &[u8], compressed: bool) -> CodecResult<Self> {
        decode_body(bytes, compressed)
    }
}

/// Serializes any value to CBOR, optionally LZ4-compressed.
pub fn encode_body<T: Serialize>(value: &T, compress: bool) -> CodecResult<Vec<u8>> {
    let mut cbor = Vec::new();
    ciborium::ser::into_writer(value, &mut cbor)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    if compress {
        Ok(lz4_flex::compress_prepend_size(&cbor))
    } else {
        Ok(cbor)
    }
}

/// Deserializes a value written by [`encode_body`].
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8], compressed: bool) -> CodecResult<T> {
    if compressed {
        let cbor = decompress(bytes)?;
        ciborium::de::from_reader(cbor.as_slice())
            .map_err(|e| CodecError::decoding_failed(e.to_string()))
    } else {
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
    }
}

fn decompress(bytes: &[u8]) -> CodecResult<Vec<u8>> {
    let (prefix, block) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| CodecError::decompression_failed("missing size prefix"))?;
    let declared = u32::from_le_bytes(*prefix) as usize;
    if declared > block.len().saturating_mul(MAX_EXPANSION) {
        return Err(CodecError::decompression_failed(format!(
            "declared size {declared} is more than {} compressed bytes can hold",
            block.len()
        )));
    }
    lz4_flex::decompress(block, declared)
        .map_err(|e| CodecError::decompression_failed(e.to_string()))
}
