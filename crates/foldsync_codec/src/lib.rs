//! # foldsync Codec
//!
//! On-disk formats for foldsync.
//!
//! This crate provides:
//! - The completion-flag envelope shared by every data file
//! - The file-name grammar that classifies update, pack and snapshot files
//! - CBOR bodies for packs and snapshots (optionally LZ4-compressed)
//! - The line codec for activity logs
//!
//! ## Format Rules
//!
//! - A data file is readable only when its first byte is `0x01`
//! - Update files hold raw merge-engine bytes after the flag, nothing else
//! - Pack and snapshot bodies are CBOR; `.lz4` names are LZ4 block-compressed
//! - Activity logs are append-only JSON lines; a line counts once its `\n`
//!   is present
//!
//! ## Usage
//!
//! ```
//! use foldsync_codec::{envelope, FileName};
//!
//! let name = FileName::pack("inst-a", 1, 6, false).unwrap();
//! assert_eq!(name.to_string(), "inst-a_pack_1-6.pack");
//!
//! let file = envelope::complete(b"raw update");
//! assert_eq!(envelope::payload(&file).unwrap(), b"raw update");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod activity;
mod body;
pub mod envelope;
mod error;
mod filename;

pub use activity::{complete_lines, ActivityKind, ActivityLine};
pub use body::{decode_body, encode_body, Decode, Encode, PackBody, PackedUpdate, SnapshotBody};
pub use envelope::FileState;
pub use error::{CodecError, CodecResult};
pub use filename::{is_valid_id, FileName};
