//! Activity logs: per-instance announcements of document events.
//!
//! Each instance appends to `activity/<instance>.log` in every root it writes
//! to. Other instances poll those logs to discover documents without walking
//! every document directory. For moves the entry is written into the target
//! root only, after the document's directory is visible there.

use crate::error::CoreResult;
use crate::root::StorageRoot;
use crate::types::{DocumentId, InstanceId, RootId, Timestamp};
use foldsync_codec::{complete_lines, ActivityKind, ActivityLine};
use foldsync_storage::Storage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry read from another instance's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Instance whose log holds the entry.
    pub instance: InstanceId,
    /// Root the log lives in.
    pub log_root: RootId,
    /// Document concerned.
    pub document_id: DocumentId,
    /// Root the document lives in after the event.
    pub root_id: RootId,
    /// Event kind.
    pub kind: ActivityKind,
    /// When the event was logged.
    pub timestamp: Timestamp,
}

/// Appends an entry to this instance's log in `root`.
pub fn record(
    storage: &dyn Storage,
    root: &StorageRoot,
    instance: &InstanceId,
    document: &DocumentId,
    kind: ActivityKind,
    now: Timestamp,
) -> CoreResult<()> {
    let line = ActivityLine {
        document_id: document.to_string(),
        root_id: root.id().to_string(),
        kind,
        timestamp: now,
    };
    storage.append(&root.activity_log(instance), &line.encode_line()?)?;
    tracing::debug!(document = %document, root = %root.id(), ?kind, "recorded activity");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorRow {
    root: RootId,
    instance: InstanceId,
    lines: u64,
}

/// How many complete lines of each foreign log have been consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityCursors {
    lines: BTreeMap<(RootId, InstanceId), u64>,
}

impl ActivityCursors {
    /// Lines consumed from one log.
    #[must_use]
    pub fn get(&self, root: &RootId, instance: &InstanceId) -> u64 {
        self.lines
            .get(&(root.clone(), instance.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn set(&mut self, root: &RootId, instance: &InstanceId, lines: u64) {
        self.lines.insert((root.clone(), instance.clone()), lines);
    }
}

impl Serialize for ActivityCursors {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<CursorRow> = self
            .lines
            .iter()
            .map(|((root, instance), &lines)| CursorRow {
                root: root.clone(),
                instance: instance.clone(),
                lines,
            })
            .collect();
        rows.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ActivityCursors {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<CursorRow>::deserialize(deserializer)?;
        Ok(Self {
            lines: rows
                .into_iter()
                .map(|row| ((row.root, row.instance), row.lines))
                .collect(),
        })
    }
}

/// Reads new entries from every other instance's log in `root`.
///
/// Only newline-terminated lines count; a trailing fragment is still being
/// written or synced and is read again next time. Lines that fail to decode
/// are logged and consumed.
pub fn poll(
    storage: &dyn Storage,
    root: &StorageRoot,
    own: &InstanceId,
    cursors: &mut ActivityCursors,
) -> CoreResult<Vec<ActivityEntry>> {
    let mut entries = Vec::new();
    for instance in root.list_activity_logs(storage)? {
        if &instance == own {
            continue;
        }
        let data = match storage.read(&root.activity_log(&instance)) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        let (lines, _) = complete_lines(&data);
        let seen = cursors.get(root.id(), &instance);
        let total = lines.len() as u64;
        if total < seen {
            tracing::warn!(root = %root.id(), instance = %instance, "activity log shrank, rereading");
        }
        let skip = if total < seen { 0 } else { seen as usize };

        for line in lines.iter().skip(skip) {
            if line.is_empty() {
                continue;
            }
            match decode(line, &instance, root.id()) {
                Some(entry) => entries.push(entry),
                None => tracing::warn!(root = %root.id(), instance = %instance, "skipping malformed activity line"),
            }
        }
        cursors.set(root.id(), &instance, total);
    }
    Ok(entries)
}

fn decode(line: &[u8], instance: &InstanceId, log_root: &RootId) -> Option<ActivityEntry> {
    let record = ActivityLine::decode_line(line).ok()?;
    Some(ActivityEntry {
        instance: instance.clone(),
        log_root: log_root.clone(),
        document_id: DocumentId::parse(&record.document_id).ok()?,
        root_id: RootId::parse(&record.root_id).ok()?,
        kind: record.kind,
        timestamp: record.timestamp,
    })
}
