//! File-name grammar for document data files.
//!
//! The kind of a file is decided by its name alone, so a directory scan can
//! classify and filter files without opening them:
//!
//! ```text
//! updates/   {instance}_{document}_{timestamp}-{sequence}.upd
//! packs/     {instance}_pack_{start}-{end}.pack[.lz4]
//! snapshots/ snapshot_{total}_{instance}.snap[.lz4]
//! ```
//!
//! Identifiers must not contain `_`, `.` or path separators.

use crate::error::{CodecError, CodecResult};
use std::fmt;

const UPDATE_EXT: &str = ".upd";
const PACK_EXT: &str = ".pack";
const SNAPSHOT_EXT: &str = ".snap";
const LZ4_EXT: &str = ".lz4";
const PACK_TAG: &str = "pack";
const SNAPSHOT_TAG: &str = "snapshot";

/// A parsed data-file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileName {
    /// One raw update written by `instance`.
    Update {
        /// Writing instance.
        instance: String,
        /// Document the update belongs to.
        document: String,
        /// Milliseconds since the Unix epoch at flush time.
        timestamp: u64,
        /// Per-(document, instance) sequence number.
        sequence: u64,
    },
    /// A pack of contiguous updates from one instance.
    Pack {
        /// Writing instance.
        instance: String,
        /// First sequence in the pack (inclusive).
        start: u64,
        /// Last sequence in the pack (inclusive).
        end: u64,
        /// Whether the body is lz4-compressed.
        compressed: bool,
    },
    /// A full-state snapshot.
    Snapshot {
        /// Sum of the snapshot's vector clock.
        total_changes: u64,
        /// Writing instance.
        instance: String,
        /// Whether the body is lz4-compressed.
        compressed: bool,
    },
}

impl FileName {
    /// Parses a file name.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidFileName`] for names that follow none of
    /// the grammars (temporary files, foreign files, hidden files).
    pub fn parse(name: &str) -> CodecResult<Self> {
        let invalid = || CodecError::invalid_file_name(name);

        if let Some(stem) = name.strip_suffix(UPDATE_EXT) {
            let mut parts = stem.split('_');
            let (Some(instance), Some(document), Some(stamp), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(invalid());
            };
            let (timestamp, sequence) = stamp.split_once('-').ok_or_else(invalid)?;
            return Ok(FileName::Update {
                instance: checked_id(instance).ok_or_else(invalid)?,
                document: checked_id(document).ok_or_else(invalid)?,
                timestamp: timestamp.parse().map_err(|_| invalid())?,
                sequence: sequence.parse().map_err(|_| invalid())?,
            });
        }

        let (base, compressed) = match name.strip_suffix(LZ4_EXT) {
            Some(base) => (base, true),
            None => (name, false),
        };

        if let Some(stem) = base.strip_suffix(PACK_EXT) {
            let mut parts = stem.split('_');
            let (Some(instance), Some(PACK_TAG), Some(range), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(invalid());
            };
            let (start, end) = range.split_once('-').ok_or_else(invalid)?;
            let start: u64 = start.parse().map_err(|_| invalid())?;
            let end: u64 = end.parse().map_err(|_| invalid())?;
            if start == 0 || end < start {
                return Err(invalid());
            }
            return Ok(FileName::Pack {
                instance: checked_id(instance).ok_or_else(invalid)?,
                start,
                end,
                compressed,
            });
        }

        if let Some(stem) = base.strip_suffix(SNAPSHOT_EXT) {
            let mut parts = stem.split('_');
            let (Some(SNAPSHOT_TAG), Some(total), Some(instance), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(invalid());
            };
            return Ok(FileName::Snapshot {
                total_changes: total.parse().map_err(|_| invalid())?,
                instance: checked_id(instance).ok_or_else(invalid)?,
                compressed,
            });
        }

        Err(invalid())
    }

    /// Builds an update file name.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidIdentifier`] if an id cannot be embedded.
    pub fn update(
        instance: &str,
        document: &str,
        timestamp: u64,
        sequence: u64,
    ) -> CodecResult<Self> {
        Ok(FileName::Update {
            instance: require_id(instance)?,
            document: require_id(document)?,
            timestamp,
            sequence,
        })
    }

    /// Builds a pack file name.
    pub fn pack(instance: &str, start: u64, end: u64, compressed: bool) -> CodecResult<Self> {
        Ok(FileName::Pack {
            instance: require_id(instance)?,
            start,
            end,
            compressed,
        })
    }

    /// Builds a snapshot file name.
    pub fn snapshot(instance: &str, total_changes: u64, compressed: bool) -> CodecResult<Self> {
        Ok(FileName::Snapshot {
            total_changes,
            instance: require_id(instance)?,
            compressed,
        })
    }

    /// The instance that owns (wrote) the file.
    #[must_use]
    pub fn instance(&self) -> &str {
        match self {
            FileName::Update { instance, .. }
            | FileName::Pack { instance, .. }
            | FileName::Snapshot { instance, .. } => instance,
        }
    }

    /// Whether the body is lz4-compressed. Update files never are.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        match self {
            FileName::Update { .. } => false,
            FileName::Pack { compressed, .. } | FileName::Snapshot { compressed, .. } => {
                *compressed
            }
        }
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileName::Update {
                instance,
                document,
                timestamp,
                sequence,
            } => write!(f, "{instance}_{document}_{timestamp}-{sequence}{UPDATE_EXT}"),
            FileName::Pack {
                instance,
                start,
                end,
                compressed,
            } => {
                write!(f, "{instance}_{PACK_TAG}_{start}-{end}{PACK_EXT}")?;
                if *compressed {
                    f.write_str(LZ4_EXT)?;
                }
                Ok(())
            }
            FileName::Snapshot {
                total_changes,
                instance,
                compressed,
            } => {
                write!(f, "{SNAPSHOT_TAG}_{total_changes}_{instance}{SNAPSHOT_EXT}")?;
                if *compressed {
                    f.write_str(LZ4_EXT)?;
                }
                Ok(())
            }
        }
    }
}

/// Returns true if `id` can be embedded in a file name.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn checked_id(id: &str) -> Option<String> {
    is_valid_id(id).then(|| id.to_string())
}

fn require_id(id: &str) -> CodecResult<String> {
    checked_id(id).ok_or_else(|| CodecError::InvalidIdentifier { id: id.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INST: &str = "6f1c2a3e-0000-4000-8000-00000000000a";
    const DOC: &str = "0b7e9c1d-1111-4111-8111-00000000000b";

    #[test]
    fn update_name_roundtrip() {
        let name = FileName::update(INST, DOC, 1_700_000_000_123, 42).unwrap();
        let text = name.to_string();
        assert_eq!(
            text,
            format!("{INST}_{DOC}_1700000000123-42.upd")
        );
        assert_eq!(FileName::parse(&text).unwrap(), name);
    }

    #[test]
    fn pack_name_roundtrip() {
        let plain = FileName::pack(INST, 1, 6, false).unwrap();
        assert_eq!(plain.to_string(), format!("{INST}_pack_1-6.pack"));
        assert_eq!(FileName::parse(&plain.to_string()).unwrap(), plain);

        let lz4 = FileName::pack(INST, 7, 9, true).unwrap();
        assert_eq!(lz4.to_string(), format!("{INST}_pack_7-9.pack.lz4"));
        assert!(FileName::parse(&lz4.to_string()).unwrap().is_compressed());
    }

    #[test]
    fn snapshot_name_roundtrip() {
        let name = FileName::snapshot(INST, 120, true).unwrap();
        assert_eq!(name.to_string(), format!("snapshot_120_{INST}.snap.lz4"));
        assert_eq!(FileName::parse(&name.to_string()).unwrap(), name);
        assert_eq!(name.instance(), INST);
    }

    #[test]
    fn rejects_foreign_names() {
        for name in [
            "README.md",
            ".DS_Store",
            "state.cbor.tmp",
            "a_b.upd",
            "a_b_c_d.upd",
            "a_b_notanumber.upd",
            "a_pack_5-3.pack",
            "a_pack_0-3.pack",
            "a_blob_1-3.pack",
            "snap_1_a.snap",
            "a_b_1-2.upd.lz4",
        ] {
            assert!(FileName::parse(name).is_err(), "accepted {name}");
        }
    }

    #[test]
    fn rejects_unembeddable_ids() {
        assert!(FileName::update("a_b", DOC, 1, 1).is_err());
        assert!(FileName::pack("", 1, 2, false).is_err());
        assert!(FileName::snapshot("a/b", 1, false).is_err());
        assert!(!is_valid_id("x.y"));
        assert!(is_valid_id(INST));
    }

    proptest::proptest! {
        #[test]
        fn any_update_name_parses_back(
            instance in "[a-f0-9-]{1,36}",
            document in "[a-f0-9-]{1,36}",
            timestamp in proptest::prelude::any::<u64>(),
            sequence in 1u64..u64::MAX,
        ) {
            let name = FileName::update(&instance, &document, timestamp, sequence).unwrap();
            proptest::prop_assert_eq!(FileName::parse(&name.to_string()).unwrap(), name);
        }
    }
}
