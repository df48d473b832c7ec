//! Inspect command implementation.

use super::{format_size, open_root, select_documents, Format};
use foldsync_core::{scan, DocumentId, DocumentScan, StorageRoot};
use foldsync_storage::{LocalStorage, Storage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Root inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Root directory.
    pub path: String,
    /// Identity from the root's `SD_ID` file.
    pub root_id: String,
    /// Instances with an activity log in the root.
    pub activity_logs: Vec<String>,
    /// Move staging directories present in the root.
    pub staging: Vec<String>,
    /// Per-document summaries.
    pub documents: Vec<DocumentSummary>,
}

/// Files of one document.
#[derive(Debug, Serialize)]
pub struct DocumentSummary {
    /// Document id.
    pub id: String,
    /// Loose update files.
    pub updates: usize,
    /// Pack files.
    pub packs: usize,
    /// Snapshot files.
    pub snapshots: usize,
    /// Highest sequence on disk per writing instance.
    pub sequences: BTreeMap<String, u64>,
    /// Bytes used by the listed files.
    pub bytes: u64,
    /// Individual file names (with `--files`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    document: Option<&str>,
    show_files: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let storage = LocalStorage::new();
    let result = inspect(&storage, path, document, show_files)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result without printing it.
pub fn inspect(
    storage: &dyn Storage,
    path: &Path,
    document: Option<&str>,
    show_files: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let root = open_root(storage, path)?;
    let mut documents = Vec::new();
    for id in select_documents(storage, &root, document)? {
        documents.push(summarize(storage, &root, &id, show_files)?);
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        root_id: root.id().to_string(),
        activity_logs: root
            .list_activity_logs(storage)?
            .iter()
            .map(ToString::to_string)
            .collect(),
        staging: root
            .list_staging(storage)?
            .iter()
            .map(ToString::to_string)
            .collect(),
        documents,
    })
}

fn summarize(
    storage: &dyn Storage,
    root: &StorageRoot,
    id: &DocumentId,
    show_files: bool,
) -> Result<DocumentSummary, Box<dyn std::error::Error>> {
    let files = scan(storage, &root.document(id), id)?;
    let paths = all_paths(&files);

    let mut bytes = 0u64;
    for path in &paths {
        match storage.read(path) {
            Ok(data) => bytes += data.len() as u64,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut sequences = BTreeMap::new();
    for instance in files
        .updates
        .iter()
        .map(|u| &u.instance)
        .chain(files.packs.iter().map(|p| &p.instance))
    {
        sequences
            .entry(instance.to_string())
            .or_insert_with(|| files.max_sequence(instance));
    }

    Ok(DocumentSummary {
        id: id.to_string(),
        updates: files.updates.len(),
        packs: files.packs.len(),
        snapshots: files.snapshots.len(),
        sequences,
        bytes,
        files: show_files.then(|| {
            paths
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect()
        }),
    })
}

fn all_paths(files: &DocumentScan) -> Vec<std::path::PathBuf> {
    files
        .updates
        .iter()
        .map(|u| u.path.clone())
        .chain(files.packs.iter().map(|p| p.path.clone()))
        .chain(files.snapshots.iter().map(|s| s.path.clone()))
        .collect()
}

fn print_text_output(result: &InspectResult) {
    println!("foldsync Root Inspection");
    println!("========================");
    println!();
    println!("Path:    {}", result.path);
    println!("Root ID: {}", result.root_id);
    println!();
    println!("Activity logs: {}", result.activity_logs.join(", "));
    if !result.staging.is_empty() {
        println!("Staging:       {}", result.staging.join(", "));
    }
    println!();
    println!("Documents ({}):", result.documents.len());
    for doc in &result.documents {
        println!(
            "  {}  {} updates, {} packs, {} snapshots, {}",
            doc.id,
            doc.updates,
            doc.packs,
            doc.snapshots,
            format_size(doc.bytes)
        );
        for (instance, seq) in &doc.sequences {
            println!("    {instance}: up to #{seq}");
        }
        if let Some(files) = &doc.files {
            for file in files {
                println!("    - {file}");
            }
        }
    }
}
