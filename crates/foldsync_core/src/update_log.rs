//! Update log: per-document, per-instance append-only update files.
//!
//! # Write protocol
//!
//! ```text
//! 1. write_new(path, [0x00] ++ payload)     durable draft
//! 2. write_at(path, 0, [0x01])              durable completion flag
//! ```
//!
//! A reader that finds `0x00` (or an empty file) is looking at a write still
//! in progress, or at a file the sync client has not finished transferring.
//! It skips the file silently and picks it up on a later read.
//!
//! # Invariants
//!
//! - An instance only creates files named after itself
//! - Sequences per `(document, instance)` are never reused
//! - A file is never modified after its flag is `0x01`

use crate::config::FlushPolicy;
use crate::context::ReplicationContext;
use crate::document::{DocumentModel, MergeableDocument};
use crate::error::{CoreError, CoreResult};
use crate::root::DocumentDirs;
use crate::types::{DocumentId, InstanceId, Timestamp, VectorClock};
use foldsync_codec::{envelope, Decode, FileName, FileState, PackBody, SnapshotBody};
use foldsync_storage::Storage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A loose update file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRef {
    /// Full path.
    pub path: PathBuf,
    /// Writing instance.
    pub instance: InstanceId,
    /// Flush time.
    pub timestamp: Timestamp,
    /// Sequence number.
    pub sequence: u64,
}

/// A pack file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackRef {
    /// Full path.
    pub path: PathBuf,
    /// Writing instance.
    pub instance: InstanceId,
    /// First sequence (inclusive).
    pub start: u64,
    /// Last sequence (inclusive).
    pub end: u64,
    /// Whether the body is compressed.
    pub compressed: bool,
}

/// A snapshot file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    /// Full path.
    pub path: PathBuf,
    /// File name, used to recognize an already-integrated snapshot.
    pub name: String,
    /// Writing instance.
    pub instance: InstanceId,
    /// Total change count claimed by the name.
    pub total: u64,
    /// Whether the body is compressed.
    pub compressed: bool,
}

/// Data files of one document, classified by name.
#[derive(Debug, Clone, Default)]
pub struct DocumentScan {
    /// Loose updates, ordered by instance then sequence.
    pub updates: Vec<UpdateRef>,
    /// Packs, ordered by instance then start.
    pub packs: Vec<PackRef>,
    /// Snapshots, highest total first.
    pub snapshots: Vec<SnapshotRef>,
}

impl DocumentScan {
    /// Returns true if no data file was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.packs.is_empty() && self.snapshots.is_empty()
    }

    /// Highest sequence of `instance` named by any update or pack.
    #[must_use]
    pub fn max_sequence(&self, instance: &InstanceId) -> u64 {
        let loose = self
            .updates
            .iter()
            .filter(|u| &u.instance == instance)
            .map(|u| u.sequence);
        let packed = self
            .packs
            .iter()
            .filter(|p| &p.instance == instance)
            .map(|p| p.end);
        loose.chain(packed).max().unwrap_or(0)
    }
}

/// Lists and classifies a document's data files.
///
/// Names that follow no grammar (temporary files, sync-client droppings) and
/// updates naming another document are ignored.
pub fn scan(
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
) -> CoreResult<DocumentScan> {
    let mut result = DocumentScan::default();

    for (dir, expected) in [
        (dirs.updates(), Kind::Update),
        (dirs.packs(), Kind::Pack),
        (dirs.snapshots(), Kind::Snapshot),
    ] {
        for entry in storage.list_dir(&dir)? {
            if entry.is_dir {
                continue;
            }
            let Ok(parsed) = FileName::parse(&entry.name) else {
                tracing::trace!(name = %entry.name, "ignoring unrecognized file");
                continue;
            };
            let path = dir.join(&entry.name);
            match (parsed, expected) {
                (
                    FileName::Update {
                        instance,
                        document: doc,
                        timestamp,
                        sequence,
                    },
                    Kind::Update,
                ) if doc == document.as_str() && sequence > 0 => {
                    result.updates.push(UpdateRef {
                        path,
                        instance: InstanceId::parse(&instance)?,
                        timestamp,
                        sequence,
                    });
                }
                (
                    FileName::Pack {
                        instance,
                        start,
                        end,
                        compressed,
                    },
                    Kind::Pack,
                ) => result.packs.push(PackRef {
                    path,
                    instance: InstanceId::parse(&instance)?,
                    start,
                    end,
                    compressed,
                }),
                (
                    FileName::Snapshot {
                        total_changes,
                        instance,
                        compressed,
                    },
                    Kind::Snapshot,
                ) => result.snapshots.push(SnapshotRef {
                    path,
                    name: entry.name.clone(),
                    instance: InstanceId::parse(&instance)?,
                    total: total_changes,
                    compressed,
                }),
                _ => tracing::trace!(name = %entry.name, "ignoring misplaced file"),
            }
        }
    }

    result
        .updates
        .sort_by(|a, b| (&a.instance, a.sequence).cmp(&(&b.instance, b.sequence)));
    result
        .packs
        .sort_by(|a, b| (&a.instance, a.start).cmp(&(&b.instance, b.start)));
    result
        .snapshots
        .sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
    Ok(result)
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Update,
    Pack,
    Snapshot,
}

/// Reads a flagged file and returns its payload.
///
/// `Ok(None)` means the file is not complete yet (or vanished); errors mean
/// the file is present but malformed.
pub fn read_payload(storage: &dyn Storage, path: &Path) -> CoreResult<Option<Vec<u8>>> {
    let data = match storage.read(path) {
        Ok(data) => data,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match envelope::payload(&data) {
        Ok(payload) => Ok(Some(payload.to_vec())),
        Err(e) if e.is_incomplete() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads a pack and checks it against its name.
pub fn read_pack(
    storage: &dyn Storage,
    pack: &PackRef,
    document: &DocumentId,
) -> CoreResult<Option<PackBody>> {
    let Some(payload) = read_payload(storage, &pack.path)? else {
        return Ok(None);
    };
    let body = PackBody::decode(&payload, pack.compressed)?;
    if body.instance_id != pack.instance.as_str()
        || body.document_id != document.as_str()
        || body.start != pack.start
        || body.end != pack.end
    {
        return Err(CoreError::malformed(
            &pack.path,
            "pack body does not match its name",
        ));
    }
    Ok(Some(body))
}

/// Reads a snapshot and returns its body with the decoded clock.
pub fn read_snapshot(
    storage: &dyn Storage,
    snapshot: &SnapshotRef,
    document: &DocumentId,
) -> CoreResult<Option<(SnapshotBody, VectorClock)>> {
    let Some(payload) = read_payload(storage, &snapshot.path)? else {
        return Ok(None);
    };
    let body = SnapshotBody::decode(&payload, snapshot.compressed)?;
    let clock = VectorClock::from_wire(&body.max_sequences)?;
    let Some(total) = clock.checked_total() else {
        return Err(CoreError::malformed(
            &snapshot.path,
            "snapshot clock total overflows",
        ));
    };
    if body.document_id != document.as_str()
        || total != body.total_change_count
        || body.total_change_count != snapshot.total
    {
        return Err(CoreError::malformed(
            &snapshot.path,
            "snapshot clock does not match its name",
        ));
    }
    Ok(Some((body, clock)))
}

/// Writes a data file with the draft-then-complete protocol.
pub fn write_flagged(storage: &dyn Storage, path: &Path, payload: &[u8]) -> CoreResult<()> {
    storage.write_new(path, &envelope::draft(payload))?;
    storage.write_at(path, 0, &[envelope::FLAG_COMPLETE])?;
    Ok(())
}

/// Writes one update file for this instance and returns its sequence.
///
/// If the write fails before anything reached disk, the sequence is handed
/// back so the stream stays gap-free.
pub fn write_update(
    storage: &dyn Storage,
    ctx: &ReplicationContext,
    dirs: &DocumentDirs,
    document: &DocumentId,
    payload: &[u8],
    now: Timestamp,
) -> CoreResult<u64> {
    let instance = ctx.instance();
    let sequence = ctx.next_sequence(document, || {
        Ok(scan(storage, dirs, document)?.max_sequence(instance))
    })?;
    let name = FileName::update(instance.as_str(), document.as_str(), now, sequence)?;
    let path = dirs.updates().join(name.to_string());

    if let Err(err) = write_flagged(storage, &path, payload) {
        if storage.remove_file(&path).is_ok() {
            ctx.release(document, sequence)?;
        }
        return Err(err);
    }
    tracing::trace!(document = %document, sequence, bytes = payload.len(), "wrote update");
    Ok(sequence)
}

/// Seals this instance's unfinished update files.
///
/// A draft left by a crash would otherwise block every reader's clock at its
/// sequence forever. A draft whose payload applies cleanly is flipped to
/// complete; anything else is replaced by an empty completed update, which
/// readers treat as a no-op.
///
/// Returns the number of files repaired.
pub fn repair_drafts<M: DocumentModel>(
    model: &M,
    storage: &dyn Storage,
    dirs: &DocumentDirs,
    document: &DocumentId,
    instance: &InstanceId,
) -> CoreResult<usize> {
    let mut repaired = 0;
    for update in scan(storage, dirs, document)?.updates {
        if &update.instance != instance {
            continue;
        }
        let data = match storage.read(&update.path) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        match FileState::of(&data) {
            FileState::Complete => continue,
            FileState::Draft => {
                let payload = &data[envelope::FLAG_LEN..];
                let mut scratch = model.new_document();
                if !payload.is_empty() && scratch.apply_update(payload).is_ok() {
                    storage.write_at(&update.path, 0, &[envelope::FLAG_COMPLETE])?;
                } else {
                    storage.replace_atomic(&update.path, &envelope::complete(&[]))?;
                }
            }
            FileState::Empty | FileState::Invalid(_) => {
                storage.replace_atomic(&update.path, &envelope::complete(&[]))?;
            }
        }
        tracing::info!(document = %document, sequence = update.sequence, "repaired unfinished update");
        repaired += 1;
    }
    Ok(repaired)
}

#[derive(Debug)]
struct Buffer {
    updates: Vec<Vec<u8>>,
    last_append: Timestamp,
}

/// In-memory buffer of local updates not yet written.
#[derive(Debug)]
pub struct UpdateBuffer {
    policy: FlushPolicy,
    buffers: Mutex<HashMap<DocumentId, Buffer>>,
}

impl UpdateBuffer {
    /// Creates an empty buffer with a flush policy.
    #[must_use]
    pub fn new(policy: FlushPolicy) -> Self {
        Self {
            policy,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffers an update. Returns true if the policy asks for a flush now.
    pub fn append(&self, document: &DocumentId, update: Vec<u8>, now: Timestamp) -> bool {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(document.clone()).or_insert_with(|| Buffer {
            updates: Vec::new(),
            last_append: now,
        });
        buffer.updates.push(update);
        buffer.last_append = now;
        match self.policy {
            FlushPolicy::Immediate => true,
            FlushPolicy::UpdateCount(n) => buffer.updates.len() >= n.max(1),
            FlushPolicy::Idle(_) => false,
        }
    }

    /// Takes all buffered updates of a document.
    pub fn take(&self, document: &DocumentId) -> Vec<Vec<u8>> {
        self.buffers
            .lock()
            .remove(document)
            .map(|b| b.updates)
            .unwrap_or_default()
    }

    /// Copies the buffered updates of a document without removing them.
    #[must_use]
    pub fn peek(&self, document: &DocumentId) -> Vec<Vec<u8>> {
        self.buffers
            .lock()
            .get(document)
            .map(|b| b.updates.clone())
            .unwrap_or_default()
    }

    /// Puts back updates that could not be written, ahead of newer ones.
    pub fn restore(&self, document: &DocumentId, mut updates: Vec<Vec<u8>>, now: Timestamp) {
        if updates.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(document.clone()).or_insert_with(|| Buffer {
            updates: Vec::new(),
            last_append: now,
        });
        updates.append(&mut buffer.updates);
        buffer.updates = updates;
    }

    /// Documents whose buffers should be flushed at `now`.
    #[must_use]
    pub fn due(&self, now: Timestamp) -> Vec<DocumentId> {
        let buffers = self.buffers.lock();
        buffers
            .iter()
            .filter(|(_, b)| match self.policy {
                FlushPolicy::Immediate => true,
                FlushPolicy::UpdateCount(n) => b.updates.len() >= n.max(1),
                FlushPolicy::Idle(idle) => {
                    now.saturating_sub(b.last_append) >= crate::clock::millis(idle)
                }
            })
            .map(|(doc, _)| doc.clone())
            .collect()
    }

    /// Documents with any buffered update.
    #[must_use]
    pub fn buffered(&self) -> Vec<DocumentId> {
        self.buffers.lock().keys().cloned().collect()
    }

    /// Number of buffered updates for a document.
    #[must_use]
    pub fn len(&self, document: &DocumentId) -> usize {
        self.buffers
            .lock()
            .get(document)
            .map_or(0, |b| b.updates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::testing::{GrowSet, GrowSetModel};
    use crate::state::MemoryStateStore;
    use foldsync_codec::{Encode, PackedUpdate};
    use foldsync_storage::MemoryStorage;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (MemoryStorage, ReplicationContext, DocumentDirs, DocumentId) {
        let storage = MemoryStorage::new();
        let ctx = ReplicationContext::load(
            InstanceId::parse("inst-a").unwrap(),
            Arc::new(MemoryStateStore::new()),
        )
        .unwrap();
        let dirs = DocumentDirs::new(PathBuf::from("/r/notes/doc-1"));
        (storage, ctx, dirs, DocumentId::parse("doc-1").unwrap())
    }

    #[test]
    fn written_update_is_complete_and_named() {
        let (storage, ctx, dirs, doc) = setup();
        let seq = write_update(&storage, &ctx, &dirs, &doc, b"payload", 1_000).unwrap();
        assert_eq!(seq, 1);

        let scan = scan(&storage, &dirs, &doc).unwrap();
        assert_eq!(scan.updates.len(), 1);
        let update = &scan.updates[0];
        assert_eq!(update.timestamp, 1_000);
        assert_eq!(
            update.path.file_name().unwrap().to_str().unwrap(),
            "inst-a_doc-1_1000-1.upd"
        );
        assert_eq!(
            read_payload(&storage, &update.path).unwrap().unwrap(),
            b"payload"
        );
    }

    #[test]
    fn drafts_and_empty_files_are_skipped_silently() {
        let (storage, _, dirs, _) = setup();
        let draft = dirs.updates().join("inst-b_doc-1_5-1.upd");
        storage.write_new(&draft, &envelope::draft(b"x")).unwrap();
        assert!(read_payload(&storage, &draft).unwrap().is_none());

        let empty = dirs.updates().join("inst-b_doc-1_5-2.upd");
        storage.write_new(&empty, &[]).unwrap();
        assert!(read_payload(&storage, &empty).unwrap().is_none());

        let bad = dirs.updates().join("inst-b_doc-1_5-3.upd");
        storage.write_new(&bad, &[0x42, 1]).unwrap();
        assert!(read_payload(&storage, &bad).is_err());
    }

    #[test]
    fn scan_ignores_foreign_and_misplaced_files() {
        let (storage, _, dirs, doc) = setup();
        storage
            .write_new(&dirs.updates().join("desktop.ini"), b"")
            .unwrap();
        storage
            .write_new(&dirs.updates().join("inst-a_other_1-1.upd"), b"\x01")
            .unwrap();
        storage
            .write_new(&dirs.packs().join("inst-a_doc-1_1-1.upd"), b"\x01")
            .unwrap();
        storage
            .write_new(&dirs.snapshots().join("snapshot_3_inst-a.snap"), b"\x01")
            .unwrap();

        let scan = scan(&storage, &dirs, &doc).unwrap();
        assert!(scan.updates.is_empty());
        assert!(scan.packs.is_empty());
        assert_eq!(scan.snapshots.len(), 1);
    }

    #[test]
    fn sequence_counter_reconciles_with_packs_on_disk() {
        let (storage, ctx, dirs, doc) = setup();
        let body = PackBody {
            instance_id: "inst-a".into(),
            document_id: "doc-1".into(),
            start: 1,
            end: 2,
            updates: (1..=2)
                .map(|seq| PackedUpdate {
                    seq,
                    timestamp: 1,
                    data: vec![],
                })
                .collect(),
        };
        write_flagged(
            &storage,
            &dirs.packs().join("inst-a_pack_1-2.pack"),
            &body.encode(false).unwrap(),
        )
        .unwrap();

        assert_eq!(write_update(&storage, &ctx, &dirs, &doc, b"x", 9).unwrap(), 3);
    }

    #[test]
    fn pack_name_mismatch_is_malformed() {
        let (storage, _, dirs, doc) = setup();
        let body = PackBody {
            instance_id: "inst-b".into(),
            document_id: "doc-1".into(),
            start: 1,
            end: 1,
            updates: vec![PackedUpdate {
                seq: 1,
                timestamp: 1,
                data: vec![1],
            }],
        };
        let path = dirs.packs().join("inst-a_pack_1-1.pack");
        write_flagged(&storage, &path, &body.encode(false).unwrap()).unwrap();

        let pack = scan(&storage, &dirs, &doc).unwrap().packs.remove(0);
        assert!(matches!(
            read_pack(&storage, &pack, &doc),
            Err(CoreError::MalformedFile { .. })
        ));
    }

    #[test]
    fn repair_seals_own_drafts_only() {
        let (storage, _, dirs, doc) = setup();
        let model = GrowSetModel::default();
        let good = dirs.updates().join("inst-a_doc-1_5-1.upd");
        let torn = dirs.updates().join("inst-a_doc-1_5-2.upd");
        let foreign = dirs.updates().join("inst-b_doc-1_5-1.upd");
        storage
            .write_new(&good, &envelope::draft(&GrowSet::update(&[1])))
            .unwrap();
        storage.write_new(&torn, &envelope::draft(&[0xff])).unwrap();
        storage.write_new(&foreign, &envelope::draft(b"x")).unwrap();

        let instance = InstanceId::parse("inst-a").unwrap();
        assert_eq!(
            repair_drafts(&model, &storage, &dirs, &doc, &instance).unwrap(),
            2
        );
        assert_eq!(
            read_payload(&storage, &good).unwrap().unwrap(),
            GrowSet::update(&[1])
        );
        assert!(read_payload(&storage, &torn).unwrap().unwrap().is_empty());
        assert!(read_payload(&storage, &foreign).unwrap().is_none());
    }

    #[test]
    fn buffer_policies() {
        let doc = DocumentId::parse("d").unwrap();

        let immediate = UpdateBuffer::new(FlushPolicy::Immediate);
        assert!(immediate.append(&doc, vec![1], 0));

        let counted = UpdateBuffer::new(FlushPolicy::UpdateCount(2));
        assert!(!counted.append(&doc, vec![1], 0));
        assert!(counted.append(&doc, vec![2], 0));
        assert_eq!(counted.due(0), vec![doc.clone()]);

        let idle = UpdateBuffer::new(FlushPolicy::Idle(Duration::from_secs(1)));
        assert!(!idle.append(&doc, vec![1], 1_000));
        assert!(idle.due(1_500).is_empty());
        assert_eq!(idle.due(2_000), vec![doc.clone()]);
        assert_eq!(idle.take(&doc), vec![vec![1]]);
        assert!(idle.due(5_000).is_empty());
    }

    #[test]
    fn restore_keeps_order() {
        let doc = DocumentId::parse("d").unwrap();
        let buffer = UpdateBuffer::new(FlushPolicy::Idle(Duration::from_secs(1)));
        buffer.append(&doc, vec![1], 0);
        let taken = buffer.take(&doc);
        buffer.append(&doc, vec![2], 0);
        buffer.restore(&doc, taken, 0);
        assert_eq!(buffer.take(&doc), vec![vec![1], vec![2]]);
    }
}
