//! Activity command implementation.

use super::{open_root, Format};
use foldsync_codec::{complete_lines, ActivityLine};
use foldsync_storage::{LocalStorage, Storage};
use serde::Serialize;
use std::path::Path;

/// One decoded line, tagged with the log it came from.
#[derive(Debug, Serialize)]
pub struct LoggedActivity {
    pub instance: String,
    pub line: u64,
    #[serde(flatten)]
    pub record: ActivityRecord,
}

/// The decoded record, or why it could not be decoded.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ActivityRecord {
    Entry(ActivityLine),
    Unreadable { error: String },
}

/// Dump of the activity logs in a root.
#[derive(Debug, Default, Serialize)]
pub struct ActivityDump {
    pub entries: Vec<LoggedActivity>,
    /// Bytes after the last newline per log, still in flight.
    pub partial: Vec<(String, usize)>,
}

/// Runs the activity command.
pub fn run(
    path: &Path,
    instance: Option<&str>,
    tail: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let storage = LocalStorage::new();
    let mut report = dump(&storage, path, instance)?;
    if let Some(tail) = tail {
        let skip = report.entries.len().saturating_sub(tail);
        report.entries.drain(..skip);
    }

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => {
            for entry in &report.entries {
                match &entry.record {
                    ActivityRecord::Entry(line) => println!(
                        "{} #{:<5} {:>13} {:?} {} -> {}",
                        entry.instance,
                        entry.line,
                        line.timestamp,
                        line.kind,
                        line.document_id,
                        line.root_id
                    ),
                    ActivityRecord::Unreadable { error } => {
                        println!("{} #{:<5} unreadable: {error}", entry.instance, entry.line);
                    }
                }
            }
            for (instance, bytes) in &report.partial {
                println!("{instance}: {bytes} byte(s) of an unfinished line");
            }
        }
    }
    Ok(())
}

/// Reads every activity log in the root, or only `instance`'s.
pub fn dump(
    storage: &dyn Storage,
    path: &Path,
    instance: Option<&str>,
) -> Result<ActivityDump, Box<dyn std::error::Error>> {
    let root = open_root(storage, path)?;
    let mut result = ActivityDump::default();

    for log in root.list_activity_logs(storage)? {
        if instance.is_some_and(|wanted| wanted != log.as_str()) {
            continue;
        }
        let data = match storage.read(&root.activity_log(&log)) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };
        let (lines, consumed) = complete_lines(&data);
        for (n, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            let record = match ActivityLine::decode_line(line) {
                Ok(record) => ActivityRecord::Entry(record),
                Err(e) => ActivityRecord::Unreadable {
                    error: e.to_string(),
                },
            };
            result.entries.push(LoggedActivity {
                instance: log.to_string(),
                line: n as u64 + 1,
                record,
            });
        }
        if consumed < data.len() {
            result.partial.push((log.to_string(), data.len() - consumed));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldsync_codec::ActivityKind;
    use foldsync_core::{record_activity, DocumentId, InstanceId, StorageRoot};
    use foldsync_storage::MemoryStorage;

    #[test]
    fn dumps_complete_lines_and_reports_fragments() {
        let storage = MemoryStorage::new();
        let root = StorageRoot::open_or_init(&storage, Path::new("/root")).unwrap();
        let inst = InstanceId::parse("inst-a").unwrap();
        let doc = DocumentId::parse("doc-1").unwrap();
        record_activity(&storage, &root, &inst, &doc, ActivityKind::Created, 1).unwrap();
        record_activity(&storage, &root, &inst, &doc, ActivityKind::Updated, 2).unwrap();
        storage
            .append(&root.activity_log(&inst), b"garbage\n{\"document_id\"")
            .unwrap();

        let all = dump(&storage, Path::new("/root"), None).unwrap();
        assert_eq!(all.entries.len(), 3);
        assert!(matches!(
            &all.entries[1].record,
            ActivityRecord::Entry(line) if line.kind == ActivityKind::Updated
        ));
        assert!(matches!(all.entries[2].record, ActivityRecord::Unreadable { .. }));
        assert_eq!(all.partial, vec![("inst-a".to_string(), 14)]);

        let other = dump(&storage, Path::new("/root"), Some("inst-b")).unwrap();
        assert!(other.entries.is_empty());
    }
}
