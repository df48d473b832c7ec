//! Cross-root move state machine.
//!
//! ```text
//! initiated ─► copying ─► files_copied ─► db_updated ─► cleaning ─► completed
//!     │           │             │              │
//!     └───────────┴──── cancelled / rolled_back┘ (db_updated: rollback only)
//! ```
//!
//! Every transition is persisted before the next step starts, and every step
//! is derived from the persisted state alone, so [`MoveCoordinator::step`]
//! can be re-run after a crash at any point. The document's root assignment
//! changes in exactly one place: the index transaction of
//! `files_copied → db_updated`. Other instances can only see the document in
//! the target root after the staging directory is renamed into place.

use crate::activity;
use crate::clock::{millis, Clock};
use crate::error::{CoreError, CoreResult};
use crate::events::{EngineEvent, EventFeed};
use crate::index::DocumentIndex;
use crate::move_store::MoveStore;
use crate::root::{DocumentDirs, RootRegistry, StagingMarker, StorageRoot};
use crate::types::{DocumentId, InstanceId, MoveId, RootId, Timestamp};
use crate::update_log::write_flagged;
use foldsync_codec::{envelope, ActivityKind, FileName, FileState};
use foldsync_storage::{copy_tree, Storage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Progress of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveState {
    /// Record created, nothing on disk yet.
    Initiated,
    /// Copying complete files into the target's staging directory.
    Copying,
    /// Staging copy finished.
    FilesCopied,
    /// The index assigns the document to the target root.
    DbUpdated,
    /// Staging promoted; source files being removed.
    Cleaning,
    /// Done.
    Completed,
    /// Abandoned before the index changed.
    RolledBack,
    /// Cancelled by the user before the index changed.
    Cancelled,
}

impl MoveState {
    /// Returns true for states that never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Cancelled)
    }

    /// Returns true while the index still assigns the document to the source.
    #[must_use]
    pub const fn can_cancel(self) -> bool {
        matches!(self, Self::Initiated | Self::Copying | Self::FilesCopied)
    }

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Copying => "copying",
            Self::FilesCopied => "files_copied",
            Self::DbUpdated => "db_updated",
            Self::Cleaning => "cleaning",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MoveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of one move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    /// The move.
    pub move_id: MoveId,
    /// Document being moved.
    pub document_id: DocumentId,
    /// Root the document leaves.
    pub source_root_id: RootId,
    /// Root the document goes to.
    pub target_root_id: RootId,
    /// Folder within the target root.
    pub target_folder: Option<String>,
    /// Current state.
    pub state: MoveState,
    /// The only instance allowed to mutate this record.
    pub initiating_instance: InstanceId,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
    /// Failed index transactions so far.
    pub attempts: u32,
    /// Last recorded failure.
    pub error: Option<String>,
}

impl MoveRecord {
    /// A new record in the `initiated` state.
    #[must_use]
    pub fn new(
        move_id: MoveId,
        document_id: DocumentId,
        source_root_id: RootId,
        target_root_id: RootId,
        target_folder: Option<String>,
        initiating_instance: InstanceId,
        now: Timestamp,
    ) -> Self {
        Self {
            move_id,
            document_id,
            source_root_id,
            target_root_id,
            target_folder,
            state: MoveState::Initiated,
            initiating_instance,
            created_at: now,
            updated_at: now,
            attempts: 0,
            error: None,
        }
    }

    /// Returns true if the record has not been touched for `window`.
    #[must_use]
    pub fn is_stale(&self, now: Timestamp, window: Duration) -> bool {
        now.saturating_sub(self.updated_at) > millis(window)
    }

    fn advance(&mut self, state: MoveState, now: Timestamp) {
        self.state = state;
        self.updated_at = now;
        self.error = None;
    }

    fn fail(&mut self, error: &CoreError, now: Timestamp) {
        self.error = Some(error.to_string());
        self.updated_at = now;
    }
}

/// Settings of the move coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePolicy {
    /// Failed index transactions before a move is rolled back.
    pub max_attempts: u32,
    /// A foreign move untouched this long may be taken over.
    pub stale_after: Duration,
}

/// Drives moves through their states.
#[derive(Debug)]
pub struct MoveCoordinator {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) roots: Arc<RootRegistry>,
    index: Arc<DocumentIndex>,
    pub(crate) store: Arc<dyn MoveStore>,
    pub(crate) events: Arc<EventFeed>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) instance: InstanceId,
    pub(crate) policy: MovePolicy,
}

impl MoveCoordinator {
    /// Creates a coordinator acting as `instance`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        roots: Arc<RootRegistry>,
        index: Arc<DocumentIndex>,
        store: Arc<dyn MoveStore>,
        events: Arc<EventFeed>,
        clock: Arc<dyn Clock>,
        instance: InstanceId,
        policy: MovePolicy,
    ) -> Self {
        Self {
            storage,
            roots,
            index,
            store,
            events,
            clock,
            instance,
            policy,
        }
    }

    /// The move record store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MoveStore> {
        &self.store
    }

    /// The instance this coordinator acts as.
    #[must_use]
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Creates a move record for `document` towards `target`.
    ///
    /// # Errors
    ///
    /// - `DocumentNotFound` if the document is not indexed
    /// - `InvalidOperation` if it already lives in `target` or another move
    ///   of it is in progress
    /// - `RootNotAccessible` if either root cannot be reached
    pub fn start(
        &self,
        document: &DocumentId,
        target: &RootId,
        folder: Option<String>,
    ) -> CoreResult<MoveRecord> {
        let source = self
            .index
            .root_of(document)
            .ok_or_else(|| CoreError::document_not_found(document))?;
        if &source == target {
            return Err(CoreError::invalid_operation(format!(
                "document {document} already lives in root {target}"
            )));
        }
        if let Some(active) = self
            .store
            .for_document(document)?
            .into_iter()
            .find(|r| !r.state.is_terminal())
        {
            return Err(CoreError::invalid_operation(format!(
                "document {document} is already being moved by {}",
                active.move_id
            )));
        }
        self.roots.require(self.storage.as_ref(), &source)?;
        self.roots.require(self.storage.as_ref(), target)?;

        let record = MoveRecord::new(
            MoveId::new(),
            document.clone(),
            source,
            target.clone(),
            folder,
            self.instance.clone(),
            self.clock.now(),
        );
        self.store.save(&record)?;
        tracing::info!(
            move_id = %record.move_id,
            document = %document,
            from = %record.source_root_id,
            to = %target,
            "move initiated"
        );
        self.emit_state(&record);
        Ok(record)
    }

    /// Performs the next step of a move this instance owns.
    ///
    /// Returns the record as persisted afterwards. A step that could not make
    /// progress (an unreachable root, a failed index transaction below the
    /// attempt limit) records the error and returns the unchanged state.
    ///
    /// # Errors
    ///
    /// - `MoveNotFound` / `MoveNotOwned`
    /// - storage errors other than the recorded ones
    pub fn step(&self, move_id: &MoveId) -> CoreResult<MoveRecord> {
        let mut record = self.load_owned(move_id)?;
        if record.state.is_terminal() {
            return Ok(record);
        }

        let (source, target) = match self.both_roots(&record) {
            Ok(roots) => roots,
            Err(err) => {
                tracing::warn!(move_id = %move_id, error = %err, "move skipped, root not accessible");
                record.fail(&err, self.clock.now());
                self.store.save(&record)?;
                return Ok(record);
            }
        };

        let before = record.state;
        match record.state {
            MoveState::Initiated => record.advance(MoveState::Copying, self.clock.now()),
            MoveState::Copying => {
                self.copy_to_staging(&record, &source, &target)?;
                record.advance(MoveState::FilesCopied, self.clock.now());
            }
            MoveState::FilesCopied => {
                let now = self.clock.now();
                match self.index.reassign(
                    &record.document_id,
                    &record.source_root_id,
                    &record.target_root_id,
                    record.target_folder.clone(),
                    now,
                ) {
                    Ok(()) => {
                        record.advance(MoveState::DbUpdated, now);
                        self.events.emit(EngineEvent::DocumentMoved {
                            document_id: record.document_id.clone(),
                            from: record.source_root_id.clone(),
                            to: record.target_root_id.clone(),
                        });
                    }
                    Err(err) => {
                        record.attempts += 1;
                        record.fail(&err, now);
                        tracing::warn!(
                            move_id = %move_id,
                            attempts = record.attempts,
                            error = %err,
                            "index update failed"
                        );
                        if record.attempts >= self.policy.max_attempts {
                            self.roll_back(&mut record, &target)?;
                        }
                    }
                }
            }
            MoveState::DbUpdated => {
                if self.index.root_of(&record.document_id).as_ref() != Some(&record.target_root_id)
                {
                    tracing::warn!(move_id = %move_id, "index change did not commit, rolling back");
                    self.roll_back(&mut record, &target)?;
                } else {
                    self.promote(&record, &source, &target)?;
                    activity::record(
                        self.storage.as_ref(),
                        &target,
                        &self.instance,
                        &record.document_id,
                        ActivityKind::Moved,
                        self.clock.now(),
                    )?;
                    record.advance(MoveState::Cleaning, self.clock.now());
                }
            }
            MoveState::Cleaning => {
                self.promote(&record, &source, &target)?;
                let source_dirs = source.document(&record.document_id);
                let swept = copy_complete_files(
                    self.storage.as_ref(),
                    &source_dirs,
                    &target.document(&record.document_id),
                )?;
                if swept > 0 {
                    tracing::info!(move_id = %move_id, swept, "carried late source files over");
                }
                self.storage.remove_dir_all(source_dirs.base())?;
                record.advance(MoveState::Completed, self.clock.now());
            }
            MoveState::Completed | MoveState::RolledBack | MoveState::Cancelled => {}
        }

        self.store.save(&record)?;
        if record.state != before {
            tracing::debug!(move_id = %move_id, from = %before, to = %record.state, "move advanced");
            self.emit_state(&record);
        }
        Ok(record)
    }

    /// Steps a move until it is terminal or stops making progress.
    pub fn run(&self, move_id: &MoveId) -> CoreResult<MoveRecord> {
        loop {
            let before = self.load_owned(move_id)?.state;
            let record = self.step(move_id)?;
            if record.state.is_terminal() || record.state == before {
                if record.state == MoveState::Completed {
                    tracing::info!(move_id = %move_id, document = %record.document_id, "move completed");
                }
                return Ok(record);
            }
        }
    }

    /// Cancels a move that has not changed the index yet.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` once the move reached `db_updated`.
    pub fn cancel(&self, move_id: &MoveId) -> CoreResult<MoveRecord> {
        let mut record = self.load_owned(move_id)?;
        if record.state.is_terminal() {
            return Ok(record);
        }
        if !record.state.can_cancel() {
            return Err(CoreError::invalid_operation(format!(
                "move {move_id} is {} and can no longer be cancelled",
                record.state
            )));
        }
        if let Some(target) = self
            .roots
            .accessible(self.storage.as_ref(), &record.target_root_id)
        {
            self.storage
                .remove_dir_all(target.staging(move_id).base())?;
        }
        record.advance(MoveState::Cancelled, self.clock.now());
        self.store.save(&record)?;
        tracing::info!(move_id = %move_id, "move cancelled");
        self.emit_state(&record);
        Ok(record)
    }

    /// Reassigns a foreign move to this instance.
    ///
    /// The record must be stale unless `force` is set, and this instance must
    /// reach both roots.
    pub fn take_over(&self, move_id: &MoveId, force: bool) -> CoreResult<MoveRecord> {
        let mut record = self
            .store
            .load(move_id)?
            .ok_or_else(|| CoreError::move_not_found(move_id))?;
        if record.state.is_terminal() {
            return Err(CoreError::invalid_operation(format!(
                "move {move_id} is already {}",
                record.state
            )));
        }
        if record.initiating_instance == self.instance {
            return Ok(record);
        }
        let now = self.clock.now();
        if !force && !record.is_stale(now, self.policy.stale_after) {
            return Err(CoreError::invalid_operation(format!(
                "move {move_id} is still being worked on by {}",
                record.initiating_instance
            )));
        }
        self.both_roots(&record)?;

        tracing::warn!(
            move_id = %move_id,
            previous = %record.initiating_instance,
            "taking over move"
        );
        record.initiating_instance = self.instance.clone();
        record.updated_at = now;
        self.store.save(&record)?;
        self.emit_state(&record);
        Ok(record)
    }

    fn load_owned(&self, move_id: &MoveId) -> CoreResult<MoveRecord> {
        let record = self
            .store
            .load(move_id)?
            .ok_or_else(|| CoreError::move_not_found(move_id))?;
        if record.initiating_instance != self.instance {
            return Err(CoreError::MoveNotOwned {
                move_id: move_id.to_string(),
                owner: record.initiating_instance.to_string(),
            });
        }
        Ok(record)
    }

    fn both_roots(&self, record: &MoveRecord) -> CoreResult<(StorageRoot, StorageRoot)> {
        let source = self
            .roots
            .require(self.storage.as_ref(), &record.source_root_id)?;
        let target = self
            .roots
            .require(self.storage.as_ref(), &record.target_root_id)?;
        Ok((source, target))
    }

    fn copy_to_staging(
        &self,
        record: &MoveRecord,
        source: &StorageRoot,
        target: &StorageRoot,
    ) -> CoreResult<()> {
        let staging = target.staging(&record.move_id);
        self.storage.remove_dir_all(staging.base())?;
        staging.create(self.storage.as_ref())?;
        let copied = copy_tree(
            self.storage.as_ref(),
            source.document(&record.document_id).base(),
            staging.base(),
            &|name: &str, data: &[u8]| is_complete_data_file(name, data),
        )?;
        target.write_staging_marker(
            self.storage.as_ref(),
            &StagingMarker {
                move_id: record.move_id.clone(),
                instance: self.instance.clone(),
                created_at: self.clock.now(),
            },
        )?;
        tracing::debug!(move_id = %record.move_id, copied, "staging copy written");
        Ok(())
    }

    /// Makes the staging copy visible under the document's name.
    ///
    /// If the final directory already exists (an earlier attempt renamed it,
    /// or synced files arrived first) the staging content is merged into it.
    fn promote(
        &self,
        record: &MoveRecord,
        source: &StorageRoot,
        target: &StorageRoot,
    ) -> CoreResult<()> {
        let staging = target.staging(&record.move_id);
        let visible = target.document(&record.document_id);
        let storage = self.storage.as_ref();

        if storage.is_dir(staging.base()) {
            storage.remove_file(&target.staging_marker(&record.move_id))?;
            if storage.is_dir(visible.base()) {
                copy_complete_files(storage, &staging, &visible)?;
                storage.remove_dir_all(staging.base())?;
            } else {
                storage.rename(staging.base(), visible.base())?;
            }
        } else if !storage.is_dir(visible.base()) {
            tracing::warn!(move_id = %record.move_id, "staging copy missing, copying from source");
            copy_complete_files(storage, &source.document(&record.document_id), &visible)?;
        }
        visible.create(storage)?;
        Ok(())
    }

    fn roll_back(&self, record: &mut MoveRecord, target: &StorageRoot) -> CoreResult<()> {
        self.storage
            .remove_dir_all(target.staging(&record.move_id).base())?;
        let error = record.error.take();
        record.advance(MoveState::RolledBack, self.clock.now());
        record.error = error;
        tracing::warn!(move_id = %record.move_id, "move rolled back");
        Ok(())
    }

    fn emit_state(&self, record: &MoveRecord) {
        self.events.emit(EngineEvent::MoveStateChanged {
            move_id: record.move_id.clone(),
            state: record.state,
        });
    }
}

fn is_complete_data_file(name: &str, data: &[u8]) -> bool {
    FileName::parse(name).is_ok() && FileState::of(data) == FileState::Complete
}

/// Copies complete data files missing from `to`, using the flag protocol so
/// a partially written copy is never mistaken for a complete file.
fn copy_complete_files(
    storage: &dyn Storage,
    from: &DocumentDirs,
    to: &DocumentDirs,
) -> CoreResult<usize> {
    let mut copied = 0;
    for (src_dir, dst_dir) in [
        (from.updates(), to.updates()),
        (from.packs(), to.packs()),
        (from.snapshots(), to.snapshots()),
    ] {
        for entry in storage.list_dir(&src_dir)? {
            if entry.is_dir {
                continue;
            }
            let dst = dst_dir.join(&entry.name);
            if storage.exists(&dst) {
                continue;
            }
            let data = match storage.read(&src_dir.join(&entry.name)) {
                Ok(data) => data,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            if !is_complete_data_file(&entry.name, &data) {
                continue;
            }
            write_flagged(storage, &dst, &data[envelope::FLAG_LEN..])?;
            copied += 1;
        }
    }
    Ok(copied)
}
