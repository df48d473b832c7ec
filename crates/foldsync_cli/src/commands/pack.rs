//! Pack command implementation.
//!
//! Packs one instance's loose updates while that instance is not running.
//! Only files written by `--instance` are touched.

use super::{open_root, select_documents};
use foldsync_core::{
    collect_garbage, pack_document, Clock, InstanceId, PackPolicy, PackReport, StorageRoot,
    SystemClock, Timestamp,
};
use foldsync_storage::{LocalStorage, Storage};
use std::path::Path;
use std::time::Duration;

/// Options for the pack command.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Instance whose updates are packed.
    pub instance: String,
    /// Restrict to one document.
    pub document: Option<String>,
    /// Minimum run length.
    pub min_run: usize,
    /// Minimum age of the packed files.
    pub min_age: Duration,
    /// Compress pack bodies with lz4.
    pub compress: bool,
    /// Delete superseded files afterwards.
    pub gc: bool,
}

/// What happened to one document.
#[derive(Debug)]
pub struct PackOutcome {
    pub document: String,
    pub packs: Vec<PackReport>,
    pub removed: usize,
}

/// Runs the pack command.
pub fn run(path: &Path, options: &PackOptions) -> Result<(), Box<dyn std::error::Error>> {
    let storage = LocalStorage::new();
    let outcomes = pack_root(&storage, path, options, SystemClock.now())?;

    let mut total = 0;
    for outcome in &outcomes {
        for pack in &outcome.packs {
            println!(
                "{}: packed #{}..#{} into {}",
                outcome.document,
                pack.start,
                pack.end,
                pack.path.display()
            );
            total += 1;
        }
        if outcome.removed > 0 {
            println!("{}: removed {} superseded file(s)", outcome.document, outcome.removed);
        }
    }
    println!();
    println!("{total} pack(s) written across {} document(s)", outcomes.len());
    Ok(())
}

/// Packs every selected document until no further run qualifies.
pub fn pack_root(
    storage: &dyn Storage,
    path: &Path,
    options: &PackOptions,
    now: Timestamp,
) -> Result<Vec<PackOutcome>, Box<dyn std::error::Error>> {
    let root = open_root(storage, path)?;
    let instance = InstanceId::parse(&options.instance)?;
    let policy = PackPolicy {
        min_age: options.min_age,
        min_run: options.min_run.max(1),
        compress: options.compress,
    };

    let mut outcomes = Vec::new();
    for id in select_documents(storage, &root, options.document.as_deref())? {
        outcomes.push(pack_one(storage, &root, &id, &instance, policy, now, options.gc)?);
    }
    Ok(outcomes)
}

fn pack_one(
    storage: &dyn Storage,
    root: &StorageRoot,
    id: &foldsync_core::DocumentId,
    instance: &InstanceId,
    policy: PackPolicy,
    now: Timestamp,
    gc: bool,
) -> Result<PackOutcome, Box<dyn std::error::Error>> {
    let dirs = root.document(id);
    let mut packs = Vec::new();
    while let Some(report) = pack_document(storage, &dirs, id, instance, policy, now)? {
        tracing::debug!(document = %id, start = report.start, end = report.end, "packed");
        packs.push(report);
    }
    let removed = if gc {
        collect_garbage(storage, &dirs, id, instance)?
    } else {
        0
    };
    Ok(PackOutcome {
        document: id.to_string(),
        packs,
        removed,
    })
}
