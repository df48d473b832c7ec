//! Replication context: who we are and which sequence comes next.
//!
//! Passed explicitly to every writer instead of living in global state.

use crate::error::CoreResult;
use crate::state::{load_cbor, save_cbor, StateStore};
use crate::types::{DocumentId, InstanceId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

const SEQUENCES_STATE: &str = "sequences.cbor";

#[derive(Debug, Default)]
struct SequenceTable {
    last: BTreeMap<DocumentId, u64>,
    /// Documents whose counter was reconciled against disk in this process.
    reconciled: HashSet<DocumentId>,
}

/// Instance identity plus persisted per-document sequence counters.
///
/// # Invariants
///
/// - Sequences start at 1 and are never reused
/// - The counter is persisted before the sequence is used
/// - On first use per process, the counter is raised to the highest
///   sequence already on disk for this instance
#[derive(Debug)]
pub struct ReplicationContext {
    instance: InstanceId,
    state: Arc<dyn StateStore>,
    table: Mutex<SequenceTable>,
}

impl ReplicationContext {
    /// Loads persisted counters.
    pub fn load(instance: InstanceId, state: Arc<dyn StateStore>) -> CoreResult<Self> {
        let last = load_cbor(state.as_ref(), SEQUENCES_STATE)?.unwrap_or_default();
        Ok(Self {
            instance,
            state,
            table: Mutex::new(SequenceTable {
                last,
                reconciled: HashSet::new(),
            }),
        })
    }

    /// This instance's id.
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Last allocated sequence for a document (0 if none).
    #[must_use]
    pub fn last_sequence(&self, document: &DocumentId) -> u64 {
        self.table.lock().last.get(document).copied().unwrap_or(0)
    }

    /// Allocates the next sequence for a document.
    ///
    /// `disk_max` is consulted once per document per process and returns the
    /// highest sequence this instance already has on disk.
    pub fn next_sequence<F>(&self, document: &DocumentId, disk_max: F) -> CoreResult<u64>
    where
        F: FnOnce() -> CoreResult<u64>,
    {
        let mut table = self.table.lock();
        let mut last = table.last.get(document).copied().unwrap_or(0);
        if !table.reconciled.contains(document) {
            let on_disk = disk_max()?;
            if on_disk > last {
                tracing::debug!(
                    document = %document,
                    persisted = last,
                    on_disk,
                    "sequence counter behind disk, raising"
                );
                last = on_disk;
            }
        }

        let next = last + 1;
        let mut updated = table.last.clone();
        updated.insert(document.clone(), next);
        save_cbor(self.state.as_ref(), SEQUENCES_STATE, &updated)?;
        table.last = updated;
        table.reconciled.insert(document.clone());
        Ok(next)
    }

    /// Returns an allocated sequence that was never written.
    ///
    /// Only the most recent allocation can be released.
    pub fn release(&self, document: &DocumentId, sequence: u64) -> CoreResult<()> {
        let mut table = self.table.lock();
        if table.last.get(document) != Some(&sequence) {
            return Ok(());
        }
        let mut updated = table.last.clone();
        updated.insert(document.clone(), sequence - 1);
        save_cbor(self.state.as_ref(), SEQUENCES_STATE, &updated)?;
        table.last = updated;
        Ok(())
    }
}
