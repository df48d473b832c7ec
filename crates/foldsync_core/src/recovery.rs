//! Startup and periodic recovery of interrupted moves.
//!
//! For every non-terminal record:
//!
//! | Owner   | Condition          | Action                                  |
//! |---------|--------------------|-----------------------------------------|
//! | own     | both roots present | resume from the persisted state         |
//! | own     | a root missing     | record the error, retry next time       |
//! | foreign | stale              | surface as [`EngineEvent::MoveNeedsAttention`] |
//! | foreign | fresh              | leave alone                             |
//!
//! Afterwards, staging directories nobody will finish are deleted and
//! terminal records past their retention are dropped.

use crate::clock::millis;
use crate::error::CoreResult;
use crate::events::EngineEvent;
use crate::moves::{MoveCoordinator, MoveRecord};
use crate::types::MoveId;
use std::time::Duration;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Own moves that reached a terminal state in this pass.
    pub finished: Vec<MoveRecord>,
    /// Own moves that could not progress (recorded error).
    pub blocked: Vec<MoveRecord>,
    /// Stale moves owned by other instances.
    pub needs_attention: Vec<MoveRecord>,
    /// Staging directories removed.
    pub orphans_removed: Vec<MoveId>,
    /// Terminal records garbage collected.
    pub records_collected: usize,
}

impl MoveCoordinator {
    /// Runs one recovery pass.
    ///
    /// Failures of individual moves are logged and reported; they never
    /// abort the pass.
    pub fn recover(&self, retention: Duration) -> CoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = self.clock.now();

        for record in self.store.active()? {
            if record.initiating_instance != self.instance {
                if record.is_stale(now, self.policy.stale_after) {
                    tracing::warn!(
                        move_id = %record.move_id,
                        owner = %record.initiating_instance,
                        state = %record.state,
                        "move appears stuck"
                    );
                    self.events.emit(EngineEvent::MoveNeedsAttention {
                        move_id: record.move_id.clone(),
                        reason: format!(
                            "owner {} has not touched the move since {}",
                            record.initiating_instance, record.updated_at
                        ),
                    });
                    report.needs_attention.push(record);
                }
                continue;
            }

            match self.run(&record.move_id) {
                Ok(after) if after.state.is_terminal() => report.finished.push(after),
                Ok(after) => report.blocked.push(after),
                Err(err) => {
                    tracing::warn!(move_id = %record.move_id, error = %err, "move recovery failed");
                    report.blocked.push(record);
                }
            }
        }

        report.orphans_removed = self.remove_orphan_staging()?;
        report.records_collected = self.collect_records(retention)?;

        if !report.finished.is_empty() || !report.orphans_removed.is_empty() {
            tracing::info!(
                finished = report.finished.len(),
                blocked = report.blocked.len(),
                orphans = report.orphans_removed.len(),
                "move recovery pass complete"
            );
        }
        Ok(report)
    }

    /// Deletes staging directories no live move will promote.
    ///
    /// A directory is an orphan when its record is terminal, or when it has
    /// no record here and its marker names this instance. Directories marked
    /// by other instances may belong to a move whose record lives on another
    /// machine and are only removed once stale.
    fn remove_orphan_staging(&self) -> CoreResult<Vec<MoveId>> {
        let storage = self.storage.as_ref();
        let now = self.clock.now();
        let mut removed = Vec::new();

        for root in self.roots.all() {
            if !root.is_reachable(storage) {
                continue;
            }
            for move_id in root.list_staging(storage)? {
                let orphan = match self.store.load(&move_id)? {
                    Some(record) => record.state.is_terminal(),
                    None => match root.read_staging_marker(storage, &move_id) {
                        Some(marker) => {
                            marker.instance == self.instance
                                || now.saturating_sub(marker.created_at) > millis(self.policy.stale_after)
                        }
                        None => false,
                    },
                };
                if orphan {
                    storage.remove_dir_all(root.staging(&move_id).base())?;
                    tracing::info!(move_id = %move_id, root = %root.id(), "removed orphaned staging directory");
                    removed.push(move_id);
                }
            }
        }
        Ok(removed)
    }

    fn collect_records(&self, retention: Duration) -> CoreResult<usize> {
        let now = self.clock.now();
        let mut collected = 0;
        for record in self.store.list()? {
            if record.state.is_terminal()
                && now.saturating_sub(record.updated_at) > millis(retention)
            {
                self.store.remove(&record.move_id)?;
                collected += 1;
            }
        }
        Ok(collected)
    }
}
