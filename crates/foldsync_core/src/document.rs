//! The mergeable document seam.
//!
//! The engine never looks inside a document. It moves update bytes between
//! files and documents, and relies on two properties of the merge engine:
//!
//! - applying an update twice is the same as applying it once
//! - updates commute, so arrival order does not matter
//!
//! The full state of a document must itself be applicable as an update; this
//! is how a snapshot seeds a fresh document.

use crate::error::CoreResult;

/// One live replica of a document.
pub trait MergeableDocument: Send {
    /// Integrates an update (or a full state) into the document.
    ///
    /// # Errors
    ///
    /// Returns `ApplyFailed` if the bytes are not a valid update.
    fn apply_update(&mut self, update: &[u8]) -> CoreResult<()>;

    /// Encodes the whole document as one update.
    fn encode_full_state(&self) -> Vec<u8>;
}

/// Factory and helpers for one kind of mergeable document.
pub trait DocumentModel: Send + Sync + 'static {
    /// The live document type.
    type Document: MergeableDocument;

    /// Creates an empty document.
    fn new_document(&self) -> Self::Document;

    /// Coalesces several buffered updates into one.
    ///
    /// Models that cannot merge updates without a live document return
    /// `None`; each update is then flushed as its own file.
    fn merge_updates(&self, _updates: &[Vec<u8>]) -> Option<Vec<u8>> {
        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{GrowSet, GrowSetModel};
    use super::*;

    #[test]
    fn apply_is_idempotent_and_commutative() {
        let u1 = GrowSet::update(&[1, 2]);
        let u2 = GrowSet::update(&[2, 3]);

        let mut a = GrowSet::default();
        a.apply_update(&u1).unwrap();
        a.apply_update(&u2).unwrap();
        a.apply_update(&u1).unwrap();

        let mut b = GrowSet::default();
        b.apply_update(&u2).unwrap();
        b.apply_update(&u1).unwrap();

        assert_eq!(a.encode_full_state(), b.encode_full_state());
    }

    #[test]
    fn full_state_seeds_a_fresh_document() {
        let mut a = GrowSet::default();
        a.apply_update(&GrowSet::update(&[7, 9])).unwrap();

        let mut b = GrowSetModel::default().new_document();
        b.apply_update(&a.encode_full_state()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn merge_is_optional() {
        let updates = vec![GrowSet::update(&[1]), GrowSet::update(&[2])];
        assert!(GrowSetModel { mergeable: false }
            .merge_updates(&updates)
            .is_none());
        let merged = GrowSetModel { mergeable: true }
            .merge_updates(&updates)
            .unwrap();
        assert_eq!(merged, GrowSet::update(&[1, 2]));
    }

    #[test]
    fn garbage_is_rejected() {
        let mut doc = GrowSet::default();
        assert!(doc.apply_update(&[0xff, 0xfe]).is_err());
    }
}
