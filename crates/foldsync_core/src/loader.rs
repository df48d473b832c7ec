//! Replica loader: reconstructs documents from their data files.
//!
//! Reconstruction order:
//!
//! 1. Every readable snapshot whose clock is not already dominated seeds the
//!    state, and the clocks are merged
//! 2. Packs not dominated by the merged clock contribute updates above it
//! 3. Loose updates contribute the same way
//! 4. Without a snapshot, every update is replayed
//!
//! Instances snapshot independently, so two snapshots may each hold history
//! the other lacks. Applying both is safe because each holds exactly the
//! updates at or below its own clock.
//!
//! The same routine serves incremental reads: a reader passes the cursor it
//! reached last time and gets only what lies above it. Because the merge is
//! idempotent and commutative, updates above a sequence gap are handed out
//! again on the next read; the cursor itself never moves past a gap.

use crate::document::{DocumentModel, MergeableDocument};
use crate::error::CoreResult;
use crate::root::DocumentDirs;
use crate::types::{contiguous_frontier, DocumentId, InstanceId, VectorClock};
use crate::update_log::{read_pack, read_payload, read_snapshot, scan, DocumentScan};
use foldsync_storage::Storage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;

/// How far a reader has integrated a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderCursor {
    /// Contiguous sequences integrated per instance.
    pub clock: VectorClock,
    /// Names of the snapshots already integrated, so they are not decoded
    /// again.
    #[serde(default)]
    pub snapshots: BTreeSet<String>,
}

/// One update handed to a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedUpdate {
    /// Writing instance.
    pub instance: InstanceId,
    /// Sequence number.
    pub sequence: u64,
    /// Raw update bytes. Empty for sealed drafts.
    pub data: Vec<u8>,
}

/// Counters describing one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Largest total change count among the snapshots used, if any.
    pub snapshot_total: Option<u64>,
    /// Packs decoded.
    pub packs_read: usize,
    /// Loose update files read.
    pub updates_read: usize,
    /// Updates applied to the document.
    pub applied: usize,
    /// Files skipped because they were not complete yet.
    pub skipped_incomplete: usize,
    /// Files skipped because they were malformed.
    pub skipped_malformed: usize,
}

/// Full state of a snapshot a reader has to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUp {
    /// Snapshot file name.
    pub name: String,
    /// Encoded full document state.
    pub state: Vec<u8>,
}

/// Result of [`read_new_updates`].
#[derive(Debug, Clone, Default)]
pub struct NewUpdates {
    /// Snapshot states to apply first, for snapshots holding more than the
    /// reader had.
    pub catch_up: Vec<CatchUp>,
    /// Updates above the reader's cursor, ordered by instance and sequence.
    pub updates: Vec<LoadedUpdate>,
    /// Cursor to persist once everything above has been applied.
    pub cursor: ReaderCursor,
    /// What the read did.
    pub stats: LoadStats,
}

impl NewUpdates {
    /// Returns true if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.catch_up.is_empty() && self.updates.is_empty()
    }
}

/// Reads everything above `since`.
pub fn read_new_updates(
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
    since: &ReaderCursor,
) -> CoreResult<NewUpdates> {
    let files = scan(storage, dirs, document)?;
    Ok(collect(storage, &files, document, since, &BTreeSet::new()))
}

fn collect(
    storage: &dyn Storage,
    files: &DocumentScan,
    document: &DocumentId,
    since: &ReaderCursor,
    rejected: &BTreeSet<String>,
) -> NewUpdates {
    let mut stats = LoadStats::default();
    let mut floor = since.clock.clone();
    let mut catch_up = Vec::new();
    let mut snapshots_seen = BTreeSet::new();

    for snapshot in &files.snapshots {
        if since.snapshots.contains(&snapshot.name) {
            snapshots_seen.insert(snapshot.name.clone());
            continue;
        }
        if rejected.contains(&snapshot.name) {
            continue;
        }
        match read_snapshot(storage, snapshot, document) {
            Ok(Some((body, clock))) => {
                if !floor.dominates(&clock) {
                    floor.merge(&clock);
                    catch_up.push(CatchUp {
                        name: snapshot.name.clone(),
                        state: body.full_state,
                    });
                    stats.snapshot_total = stats.snapshot_total.max(Some(snapshot.total));
                }
                snapshots_seen.insert(snapshot.name.clone());
            }
            Ok(None) => stats.skipped_incomplete += 1,
            Err(err) => {
                tracing::warn!(path = %snapshot.path.display(), error = %err, "skipping malformed snapshot");
                stats.skipped_malformed += 1;
            }
        }
    }

    let mut available: BTreeMap<InstanceId, BTreeSet<u64>> = BTreeMap::new();
    let mut collected: BTreeMap<(InstanceId, u64), Vec<u8>> = BTreeMap::new();

    for pack in &files.packs {
        if pack.end <= floor.get(&pack.instance) {
            continue;
        }
        match read_pack(storage, pack, document) {
            Ok(Some(body)) => {
                stats.packs_read += 1;
                let seen = available.entry(pack.instance.clone()).or_default();
                for update in body.updates {
                    seen.insert(update.seq);
                    if !floor.covers(&pack.instance, update.seq) {
                        collected.insert((pack.instance.clone(), update.seq), update.data);
                    }
                }
            }
            Ok(None) => stats.skipped_incomplete += 1,
            Err(err) => {
                tracing::warn!(path = %pack.path.display(), error = %err, "skipping malformed pack");
                stats.skipped_malformed += 1;
            }
        }
    }

    for update in &files.updates {
        if floor.covers(&update.instance, update.sequence) {
            continue;
        }
        let key = (update.instance.clone(), update.sequence);
        if collected.contains_key(&key) {
            continue;
        }
        match read_payload(storage, &update.path) {
            Ok(Some(data)) => {
                stats.updates_read += 1;
                available
                    .entry(update.instance.clone())
                    .or_default()
                    .insert(update.sequence);
                collected.insert(key, data);
            }
            Ok(None) => stats.skipped_incomplete += 1,
            Err(err) => {
                tracing::warn!(path = %update.path.display(), error = %err, "skipping malformed update");
                stats.skipped_malformed += 1;
            }
        }
    }

    let mut clock = floor.clone();
    for (instance, sequences) in &available {
        clock.set(
            instance.clone(),
            contiguous_frontier(floor.get(instance), sequences),
        );
    }

    NewUpdates {
        catch_up,
        updates: collected
            .into_iter()
            .map(|((instance, sequence), data)| LoadedUpdate {
                instance,
                sequence,
                data,
            })
            .collect(),
        cursor: ReaderCursor {
            clock,
            snapshots: snapshots_seen,
        },
        stats,
    }
}

/// Applies snapshot states in order and returns the first rejected one.
fn apply_catch_up<D: MergeableDocument>(
    doc: &mut D,
    document: &DocumentId,
    catch_up: Vec<CatchUp>,
) -> Option<String> {
    for snapshot in catch_up {
        if let Err(err) = doc.apply_update(&snapshot.state) {
            tracing::warn!(
                document = %document,
                snapshot = %snapshot.name,
                error = %err,
                "snapshot state rejected, reading without it"
            );
            return Some(snapshot.name);
        }
    }
    None
}

/// Outcome of integrating new files into a live document.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// The cursor reached.
    pub cursor: ReaderCursor,
    /// What was read and applied.
    pub stats: LoadStats,
}

impl SyncOutcome {
    /// Returns true if the document changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.stats.applied > 0 || self.stats.snapshot_total.is_some()
    }
}

/// Brings a live document up to date with the files on disk.
///
/// When `exact` is set, updates above the reached cursor (past a gap) are
/// left out, so the document state is exactly what the cursor describes.
pub fn sync_into<D: MergeableDocument>(
    doc: &mut D,
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
    since: &ReaderCursor,
    exact: bool,
) -> CoreResult<SyncOutcome> {
    let files = scan(storage, dirs, document)?;
    let mut rejected = BTreeSet::new();
    let mut new = collect(storage, &files, document, since, &rejected);

    // A rejected snapshot is left out and the read is redone, since its
    // clock may have hidden updates that are still on disk.
    while let Some(name) = apply_catch_up(doc, document, mem::take(&mut new.catch_up)) {
        rejected.insert(name);
        new = collect(storage, &files, document, since, &rejected);
    }
    new.stats.skipped_malformed += rejected.len();

    for update in &new.updates {
        if update.data.is_empty() {
            continue;
        }
        if exact && !new.cursor.clock.covers(&update.instance, update.sequence) {
            continue;
        }
        match doc.apply_update(&update.data) {
            Ok(()) => new.stats.applied += 1,
            Err(err) => {
                tracing::warn!(
                    document = %document,
                    instance = %update.instance,
                    sequence = update.sequence,
                    error = %err,
                    "skipping update rejected by the document model"
                );
                new.stats.skipped_malformed += 1;
            }
        }
    }

    Ok(SyncOutcome {
        cursor: new.cursor,
        stats: new.stats,
    })
}

/// A freshly loaded document.
#[derive(Debug)]
pub struct LoadedDocument<D> {
    /// The reconstructed document.
    pub document: D,
    /// Cursor reached by the load.
    pub cursor: ReaderCursor,
    /// What the load read.
    pub stats: LoadStats,
}

impl<D> LoadedDocument<D> {
    /// Returns true if the load found any complete data.
    #[must_use]
    pub fn found_data(&self) -> bool {
        !self.cursor.clock.is_empty() || self.stats.applied > 0
    }
}

/// Loads a document from scratch.
pub fn load<M: DocumentModel>(
    model: &M,
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
) -> CoreResult<LoadedDocument<M::Document>> {
    let mut doc = model.new_document();
    let outcome = sync_into(
        &mut doc,
        storage,
        dirs,
        document,
        &ReaderCursor::default(),
        false,
    )?;
    tracing::debug!(
        document = %document,
        snapshot = ?outcome.stats.snapshot_total,
        packs = outcome.stats.packs_read,
        updates = outcome.stats.updates_read,
        "loaded document"
    );
    Ok(LoadedDocument {
        document: doc,
        cursor: outcome.cursor,
        stats: outcome.stats,
    })
}
