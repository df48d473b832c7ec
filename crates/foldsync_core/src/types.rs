//! Core type definitions for foldsync.

use crate::error::{CoreError, CoreResult};
use foldsync_codec::is_valid_id;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! text_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wraps an existing identifier.
            ///
            /// # Errors
            ///
            /// Returns `InvalidOperation` if the text cannot be embedded in a
            /// file name (empty, or containing characters other than ASCII
            /// alphanumerics and `-`).
            pub fn parse(text: &str) -> CoreResult<Self> {
                if is_valid_id(text) {
                    Ok(Self(text.to_string()))
                } else {
                    Err(CoreError::invalid_operation(format!(
                        "invalid {} id: {text:?}",
                        $label
                    )))
                }
            }

            /// Returns the identifier text.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> CoreResult<Self> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoreError;

            fn try_from(value: String) -> CoreResult<Self> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

text_id!(
    /// Stable identifier of a document, constant across moves.
    DocumentId,
    "document"
);

text_id!(
    /// Identifier of one running replica.
    ///
    /// An instance writes only files named after its own id.
    InstanceId,
    "instance"
);

text_id!(
    /// Immutable identifier of a storage root, persisted in `SD_ID`.
    RootId,
    "root"
);

text_id!(
    /// Identifier of a cross-root move.
    MoveId,
    "move"
);

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Per-instance high-water marks of integrated sequences.
///
/// For each instance the clock holds the highest sequence `n` such that every
/// sequence in `1..=n` has been integrated. Sequences above a gap are never
/// counted, so a clock always describes a set of updates exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<InstanceId, u64>);

impl VectorClock {
    /// Creates an empty clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the integrated sequence for an instance (0 if none).
    #[must_use]
    pub fn get(&self, instance: &InstanceId) -> u64 {
        self.0.get(instance).copied().unwrap_or(0)
    }

    /// Sets the integrated sequence for an instance.
    pub fn set(&mut self, instance: InstanceId, sequence: u64) {
        if sequence == 0 {
            self.0.remove(&instance);
        } else {
            self.0.insert(instance, sequence);
        }
    }

    /// Returns true if `sequence` of `instance` is already integrated.
    #[must_use]
    pub fn covers(&self, instance: &InstanceId, sequence: u64) -> bool {
        sequence <= self.get(instance)
    }

    /// Returns true if every entry of `other` is covered by `self`.
    #[must_use]
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.0.iter().all(|(inst, &seq)| self.covers(inst, seq))
    }

    /// Raises every entry to at least the value in `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (inst, &seq) in &other.0 {
            if seq > self.get(inst) {
                self.0.insert(inst.clone(), seq);
            }
        }
    }

    /// Sum of all entries, saturating at `u64::MAX`.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().fold(0, |sum, &seq| sum.saturating_add(seq))
    }

    /// Sum of all entries, or `None` if it does not fit in a `u64`.
    #[must_use]
    pub fn checked_total(&self) -> Option<u64> {
        self.0
            .values()
            .try_fold(0u64, |sum, &seq| sum.checked_add(seq))
    }

    /// Returns true if no instance has an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(instance, sequence)` pairs in instance order.
    pub fn iter(&self) -> impl Iterator<Item = (&InstanceId, u64)> {
        self.0.iter().map(|(inst, &seq)| (inst, seq))
    }

    /// Converts to the string-keyed map stored in snapshot bodies.
    #[must_use]
    pub fn to_wire(&self) -> BTreeMap<String, u64> {
        self.0
            .iter()
            .map(|(inst, &seq)| (inst.to_string(), seq))
            .collect()
    }

    /// Builds a clock from a snapshot body map.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is not a valid instance id.
    pub fn from_wire(wire: &BTreeMap<String, u64>) -> CoreResult<Self> {
        let mut clock = Self::new();
        for (inst, &seq) in wire {
            clock.set(InstanceId::parse(inst)?, seq);
        }
        Ok(clock)
    }
}

impl FromIterator<(InstanceId, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (InstanceId, u64)>>(iter: T) -> Self {
        let mut clock = Self::new();
        for (inst, seq) in iter {
            clock.set(inst, seq);
        }
        clock
    }
}

/// Advances `from` over a contiguous run of available sequences.
///
/// Returns the largest `n >= from` such that every sequence in `from+1..=n`
/// is in `available`.
#[must_use]
pub fn contiguous_frontier(from: u64, available: &BTreeSet<u64>) -> u64 {
    let mut frontier = from;
    for &seq in available.range(from.saturating_add(1)..) {
        if Some(seq) != frontier.checked_add(1) {
            break;
        }
        frontier = seq;
    }
    frontier
}
