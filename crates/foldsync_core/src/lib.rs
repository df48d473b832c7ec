//! # foldsync Core
//!
//! File-based replication engine for foldsync.
//!
//! Documents are replicated between independent instances through plain
//! shared directories (typically cloud-synced folders) with no server and no
//! cross-instance locking. This crate provides:
//! - Per-instance append-only update logs with a completion flag byte
//! - Consolidation into packs and vector-clocked snapshots
//! - Reconstruction of documents from whatever files have arrived
//! - Activity logs for discovering created, updated and moved documents
//! - An atomic, crash-recoverable move of documents between storage roots
//!
//! ## Design Principles
//!
//! - An instance only ever writes files named after itself
//! - A file is visible as complete only once its flag byte says so
//! - Reading never fails because of one bad or unfinished file
//! - Every move step is a durable checkpoint that can be resumed
//!
//! ## Example
//!
//! ```rust,ignore
//! use foldsync_core::{Config, Engine};
//! use std::path::Path;
//!
//! let engine = Engine::open(Config::new("state"), MyModel)?;
//! let notes = engine.add_root(Path::new("/mnt/cloud/notes"))?;
//! let doc = engine.create_document(&notes, None)?;
//! engine.apply_local_update(&doc, update_bytes)?;
//! engine.close()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod activity;
mod clock;
mod config;
mod consolidator;
mod context;
mod dir;
mod document;
mod engine;
mod error;
mod events;
mod index;
mod loader;
mod move_store;
mod moves;
mod recovery;
mod root;
mod scheduler;
mod state;
mod types;
mod update_log;

pub use activity::{poll as poll_activity, record as record_activity, ActivityCursors, ActivityEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, FlushPolicy};
pub use consolidator::{
    collect_garbage, pack_document, snapshot_document, PackPolicy, PackReport, SnapshotPolicy,
    SnapshotReport,
};
pub use context::ReplicationContext;
pub use dir::InstanceDir;
pub use document::{DocumentModel, MergeableDocument};
pub use engine::{
    DiscoveryReport, Engine, EngineParts, MaintenanceReport, PendingImport, RootInfo,
};
pub use error::{CoreError, CoreResult};
pub use events::{EngineEvent, EventFeed};
pub use index::{DocumentEntry, DocumentIndex, IndexTxn};
pub use loader::{
    load, read_new_updates, sync_into, CatchUp, LoadStats, LoadedDocument, LoadedUpdate,
    NewUpdates, ReaderCursor, SyncOutcome,
};
pub use move_store::{FileMoveStore, MemoryMoveStore, MoveStore};
pub use moves::{MoveCoordinator, MovePolicy, MoveRecord, MoveState};
pub use recovery::RecoveryReport;
pub use root::{DocumentDirs, RootRegistry, StagingMarker, StorageRoot, ROOT_ID_FILE};
pub use scheduler::{BackgroundTasks, CancelToken, TaskKind, TaskRunner, TaskScheduler};
pub use state::{MemoryStateStore, StateStore};
pub use types::{contiguous_frontier, DocumentId, InstanceId, MoveId, RootId, Timestamp, VectorClock};
pub use update_log::{
    read_pack, read_payload, read_snapshot, repair_drafts, scan, write_flagged, write_update,
    DocumentScan, PackRef, SnapshotRef, UpdateBuffer, UpdateRef,
};
