//! Verify command implementation.

use super::{open_root, select_documents, CliError};
use foldsync_codec::{FileName, FileState};
use foldsync_core::{read_pack, read_snapshot, scan, DocumentId, StorageRoot};
use foldsync_storage::{LocalStorage, Storage};
use std::path::{Path, PathBuf};

/// How one file looked to the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Flag set and body decodes.
    Complete,
    /// Still being written or synced.
    Incomplete,
    /// Present but unusable.
    Malformed(String),
}

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of data files checked.
    pub files_checked: usize,
    /// Files that are complete and decode.
    pub complete: usize,
    /// Drafts and empty files.
    pub incomplete: Vec<PathBuf>,
    /// Files that can never be read.
    pub malformed: Vec<(PathBuf, String)>,
    /// Names that follow no file grammar.
    pub ignored: Vec<PathBuf>,
}

impl VerifyResult {
    fn record(&mut self, path: PathBuf, verdict: Verdict) {
        self.files_checked += 1;
        match verdict {
            Verdict::Complete => self.complete += 1,
            Verdict::Incomplete => self.incomplete.push(path),
            Verdict::Malformed(reason) => self.malformed.push((path, reason)),
        }
    }

    fn is_ok(&self) -> bool {
        self.malformed.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, document: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying root at {path:?}");
    println!();

    let storage = LocalStorage::new();
    let result = verify(&storage, path, document)?;

    println!("Files checked: {}", result.files_checked);
    println!("  complete:    {}", result.complete);
    println!("  incomplete:  {}", result.incomplete.len());
    println!("  malformed:   {}", result.malformed.len());
    for path in &result.incomplete {
        println!("    ~ {}", path.display());
    }
    for (path, reason) in &result.malformed {
        println!("    ! {}: {reason}", path.display());
    }
    if !result.ignored.is_empty() {
        println!("Ignored {} unrecognized file(s)", result.ignored.len());
    }

    println!();
    if result.is_ok() {
        println!("✓ Root verification passed");
        Ok(())
    } else {
        println!("✗ Root verification failed");
        Err(CliError::VerifyFailed(result.malformed.len()).into())
    }
}

/// Classifies every data file of the selected documents.
pub fn verify(
    storage: &dyn Storage,
    path: &Path,
    document: Option<&str>,
) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let root = open_root(storage, path)?;
    let mut result = VerifyResult::default();
    for id in select_documents(storage, &root, document)? {
        verify_document(storage, &root, &id, &mut result)?;
    }
    Ok(result)
}

fn verify_document(
    storage: &dyn Storage,
    root: &StorageRoot,
    id: &DocumentId,
    result: &mut VerifyResult,
) -> Result<(), Box<dyn std::error::Error>> {
    let dirs = root.document(id);
    for dir in [dirs.updates(), dirs.packs(), dirs.snapshots()] {
        for entry in storage.list_dir(&dir)? {
            if !entry.is_dir && FileName::parse(&entry.name).is_err() {
                result.ignored.push(dir.join(&entry.name));
            }
        }
    }

    let files = scan(storage, &dirs, id)?;
    for update in &files.updates {
        let verdict = match storage.read(&update.path) {
            Ok(data) => flag_verdict(&data),
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        result.record(update.path.clone(), verdict);
    }
    for pack in &files.packs {
        let verdict = match read_pack(storage, pack, id) {
            Ok(Some(_)) => Verdict::Complete,
            Ok(None) => Verdict::Incomplete,
            Err(e) => Verdict::Malformed(e.to_string()),
        };
        result.record(pack.path.clone(), verdict);
    }
    for snapshot in &files.snapshots {
        let verdict = match read_snapshot(storage, snapshot, id) {
            Ok(Some(_)) => Verdict::Complete,
            Ok(None) => Verdict::Incomplete,
            Err(e) => Verdict::Malformed(e.to_string()),
        };
        result.record(snapshot.path.clone(), verdict);
    }
    Ok(())
}

/// Update payloads are opaque, so only the flag byte can be judged.
fn flag_verdict(data: &[u8]) -> Verdict {
    match FileState::of(data) {
        FileState::Complete => Verdict::Complete,
        FileState::Draft | FileState::Empty => Verdict::Incomplete,
        FileState::Invalid(flag) => Verdict::Malformed(format!("unknown flag byte {flag:#04x}")),
    }
}
