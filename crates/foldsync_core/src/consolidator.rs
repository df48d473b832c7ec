//! Consolidation: packs, snapshots and garbage collection.
//!
//! Consolidation only ever reduces the number of files; it never changes what
//! a loader reconstructs. Each instance consolidates only its own stream.
//!
//! ## Invariants
//!
//! - A pack covers exactly the contiguous sequences it names
//! - A pack is complete on disk before any original is deleted
//! - A snapshot's state is exactly the updates at or below its clock
//! - A file is deleted only when a complete, readable file supersedes it
//! - An own snapshot is deleted only when another snapshot dominates it;
//!   of two snapshots with equal clocks the one with the greater name stays

use crate::clock::millis;
use crate::document::{DocumentModel, MergeableDocument};
use crate::error::CoreResult;
use crate::loader::{sync_into, ReaderCursor};
use crate::root::DocumentDirs;
use crate::types::{DocumentId, InstanceId, Timestamp, VectorClock};
use crate::update_log::{
    read_pack, read_payload, read_snapshot, scan, write_flagged, DocumentScan, SnapshotRef,
    UpdateRef,
};
use foldsync_codec::{Encode, FileName, PackBody, PackedUpdate, SnapshotBody};
use foldsync_storage::Storage;
use std::path::PathBuf;
use std::time::Duration;

/// Packing parameters.
#[derive(Debug, Clone, Copy)]
pub struct PackPolicy {
    /// Update files younger than this are left alone.
    pub min_age: Duration,
    /// Shortest run worth a pack.
    pub min_run: usize,
    /// Whether to compress the pack body.
    pub compress: bool,
}

/// Snapshot parameters.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    /// Changes since the newest snapshot that justify a new one.
    pub threshold: u64,
    /// Whether to compress the snapshot body.
    pub compress: bool,
}

/// A pack written by [`pack_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackReport {
    /// First sequence packed.
    pub start: u64,
    /// Last sequence packed.
    pub end: u64,
    /// Path of the new pack.
    pub path: PathBuf,
}

/// A snapshot written by [`snapshot_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Clock embedded in the snapshot.
    pub clock: VectorClock,
    /// Path of the new snapshot.
    pub path: PathBuf,
}

/// Complete, readable snapshots with their clocks.
fn readable_snapshots<'a>(
    storage: &dyn Storage,
    files: &'a DocumentScan,
    document: &DocumentId,
) -> Vec<(&'a SnapshotRef, VectorClock)> {
    files
        .snapshots
        .iter()
        .filter_map(|snapshot| match read_snapshot(storage, snapshot, document) {
            Ok(Some((_, clock))) => Some((snapshot, clock)),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(path = %snapshot.path.display(), error = %err, "ignoring malformed snapshot");
                None
            }
        })
        .collect()
}

/// Merged clock of every readable snapshot, which is what a loader seeds.
fn snapshot_coverage(snapshots: &[(&SnapshotRef, VectorClock)]) -> VectorClock {
    let mut coverage = VectorClock::new();
    for (_, clock) in snapshots {
        coverage.merge(clock);
    }
    coverage
}

/// Returns true if another snapshot makes `snapshot` redundant.
fn superseded(
    snapshot: &SnapshotRef,
    clock: &VectorClock,
    snapshots: &[(&SnapshotRef, VectorClock)],
) -> bool {
    snapshots.iter().any(|(other, other_clock)| {
        other.name != snapshot.name
            && other_clock.dominates(clock)
            && (other_clock != clock || other.name > snapshot.name)
    })
}

/// Packs the oldest contiguous run of this instance's loose updates.
///
/// The run starts at the lowest loose update not yet packed or snapshotted
/// and ends before the first gap, the first file younger than
/// `policy.min_age`, or the first file that is not complete and readable.
/// Nothing is written if the run is shorter than `policy.min_run`.
pub fn pack_document(
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
    instance: &InstanceId,
    policy: PackPolicy,
    now: Timestamp,
) -> CoreResult<Option<PackReport>> {
    let files = scan(storage, dirs, document)?;
    let packed_to = files
        .packs
        .iter()
        .filter(|p| &p.instance == instance)
        .map(|p| p.end)
        .max()
        .unwrap_or(0);
    let snapshot_to = snapshot_coverage(&readable_snapshots(storage, &files, document))
        .get(instance);
    let floor = packed_to.max(snapshot_to);

    let candidates: Vec<&UpdateRef> = files
        .updates
        .iter()
        .filter(|u| &u.instance == instance && u.sequence > floor)
        .collect();
    let cutoff = now.saturating_sub(millis(policy.min_age));

    let mut run: Vec<PackedUpdate> = Vec::new();
    let mut originals = Vec::new();
    for update in candidates {
        if let Some(last) = run.last() {
            if update.sequence != last.seq + 1 {
                break;
            }
        }
        if update.timestamp > cutoff {
            break;
        }
        let data = match read_payload(storage, &update.path) {
            Ok(Some(data)) => data,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(path = %update.path.display(), error = %err, "own update unreadable, not packing past it");
                break;
            }
        };
        run.push(PackedUpdate {
            seq: update.sequence,
            timestamp: update.timestamp,
            data,
        });
        originals.push(update.path.clone());
    }

    if run.is_empty() || run.len() < policy.min_run.max(1) {
        return Ok(None);
    }
    let (start, end) = (run[0].seq, run[run.len() - 1].seq);

    let body = PackBody {
        instance_id: instance.to_string(),
        document_id: document.to_string(),
        start,
        end,
        updates: run,
    };
    body.validate()?;
    let name = FileName::pack(instance.as_str(), start, end, policy.compress)?;
    let path = dirs.packs().join(name.to_string());
    write_flagged(storage, &path, &body.encode(policy.compress)?)?;

    for original in &originals {
        storage.remove_file(original)?;
    }
    tracing::debug!(document = %document, start, end, "packed updates");
    Ok(Some(PackReport { start, end, path }))
}

/// Writes a snapshot once enough changes accumulated since the newest one.
///
/// The state is rebuilt from every readable snapshot plus exactly the
/// contiguous updates above their merged clock, so the recorded clock
/// describes the state.
pub fn snapshot_document<M: DocumentModel>(
    model: &M,
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
    instance: &InstanceId,
    policy: SnapshotPolicy,
    now: Timestamp,
) -> CoreResult<Option<SnapshotReport>> {
    let mut doc = model.new_document();
    let outcome = sync_into(
        &mut doc,
        storage,
        dirs,
        document,
        &ReaderCursor::default(),
        true,
    )?;
    let clock = outcome.cursor.clock;
    let base = outcome.stats.snapshot_total.unwrap_or(0);
    if clock.is_empty() || clock.total().saturating_sub(base) < policy.threshold.max(1) {
        return Ok(None);
    }

    let name = FileName::snapshot(instance.as_str(), clock.total(), policy.compress)?;
    let path = dirs.snapshots().join(name.to_string());
    if storage.exists(&path) {
        return Ok(None);
    }
    let body = SnapshotBody {
        document_id: document.to_string(),
        full_state: doc.encode_full_state(),
        max_sequences: clock.to_wire(),
        total_change_count: clock.total(),
        timestamp: now,
    };
    write_flagged(storage, &path, &body.encode(policy.compress)?)?;
    tracing::debug!(document = %document, total = clock.total(), "wrote snapshot");
    Ok(Some(SnapshotReport { clock, path }))
}

/// Deletes this instance's files that a complete file supersedes.
///
/// - loose updates and packs dominated by the merged snapshot clock
/// - loose updates already inside one of this instance's packs
/// - this instance's snapshots that another snapshot supersedes
///
/// Returns the number of files removed.
pub fn collect_garbage(
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
    instance: &InstanceId,
) -> CoreResult<usize> {
    let files = scan(storage, dirs, document)?;
    let snapshots = readable_snapshots(storage, &files, document);
    let covered = snapshot_coverage(&snapshots).get(instance);

    let mut packed: Vec<(u64, u64)> = Vec::new();
    let mut doomed: Vec<PathBuf> = Vec::new();
    for pack in files.packs.iter().filter(|p| &p.instance == instance) {
        if pack.end <= covered {
            doomed.push(pack.path.clone());
        } else if matches!(read_pack(storage, pack, document), Ok(Some(_))) {
            packed.push((pack.start, pack.end));
        }
    }
    for update in files.updates.iter().filter(|u| &u.instance == instance) {
        let in_pack = packed
            .iter()
            .any(|&(start, end)| (start..=end).contains(&update.sequence));
        if update.sequence <= covered || in_pack {
            doomed.push(update.path.clone());
        }
    }
    for (snapshot, clock) in snapshots.iter().filter(|(s, _)| &s.instance == instance) {
        if superseded(snapshot, clock, &snapshots) {
            doomed.push(snapshot.path.clone());
        }
    }

    for path in &doomed {
        storage.remove_file(path)?;
    }
    if !doomed.is_empty() {
        tracing::debug!(document = %document, removed = doomed.len(), "collected superseded files");
    }
    Ok(doomed.len())
}
