//! Engine facade.

use crate::activity::{self, ActivityCursors, ActivityEntry};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::consolidator::{
    collect_garbage, pack_document, snapshot_document, PackPolicy, SnapshotPolicy,
};
use crate::context::ReplicationContext;
use crate::dir::InstanceDir;
use crate::document::{DocumentModel, MergeableDocument};
use crate::error::{CoreError, CoreResult};
use crate::events::{EngineEvent, EventFeed};
use crate::index::{DocumentEntry, DocumentIndex};
use crate::loader::{self, NewUpdates, ReaderCursor};
use crate::move_store::{FileMoveStore, MoveStore};
use crate::moves::{MoveCoordinator, MovePolicy, MoveRecord};
use crate::recovery::RecoveryReport;
use crate::root::{RootRegistry, StorageRoot};
use crate::scheduler::{BackgroundTasks, TaskKind, TaskRunner, TaskScheduler};
use crate::state::{load_cbor, save_cbor, StateStore};
use crate::types::{DocumentId, InstanceId, MoveId, RootId, Timestamp};
use crate::update_log::{read_payload, repair_drafts, scan, write_update, UpdateBuffer};
use foldsync_codec::ActivityKind;
use foldsync_storage::{LocalStorage, Storage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ROOTS_STATE: &str = "roots.cbor";
const CURSORS_STATE: &str = "cursors.cbor";
const PENDING_STATE: &str = "pending.cbor";

/// Injected components for [`Engine::open_with`].
#[derive(Debug, Clone)]
pub struct EngineParts {
    /// Byte store all roots live in.
    pub storage: Arc<dyn Storage>,
    /// Instance-local state.
    pub state: Arc<dyn StateStore>,
    /// Move record store.
    pub moves: Arc<dyn MoveStore>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// This instance's identity.
    pub instance: InstanceId,
}

/// A registered root as reported by [`Engine::list_roots`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInfo {
    /// Root identity.
    pub id: RootId,
    /// Last known path.
    pub path: PathBuf,
    /// Whether the root is reachable right now.
    pub accessible: bool,
}

/// What a discovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Activity entries read.
    pub entries: usize,
    /// Open documents that integrated new files.
    pub reloaded: Vec<DocumentId>,
    /// Unknown documents registered.
    pub imported: Vec<DocumentId>,
    /// Known documents whose root assignment changed.
    pub reassigned: Vec<DocumentId>,
    /// Entries still waiting for their files.
    pub pending: usize,
}

/// What a maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Packs written.
    pub packs: usize,
    /// Snapshots written.
    pub snapshots: usize,
    /// Files garbage collected.
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootRow {
    id: RootId,
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReaderRow {
    reader: String,
    document: DocumentId,
    cursor: ReaderCursor,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CursorFile {
    readers: Vec<ReaderRow>,
    activity: ActivityCursors,
}

#[derive(Debug, Default)]
struct Cursors {
    readers: BTreeMap<(String, DocumentId), ReaderCursor>,
    activity: ActivityCursors,
}

/// A discovered document whose files have not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingImport {
    /// The document.
    pub document_id: DocumentId,
    /// Root the document was announced in.
    pub root_id: RootId,
    /// When it was first seen.
    pub first_seen: Timestamp,
    /// Failed attempts so far.
    pub attempts: u32,
}

struct OpenDocument<D> {
    document: D,
    cursor: ReaderCursor,
}

/// The replication engine of one instance.
///
/// `Engine` ties the pieces together:
/// - the local index of documents and their roots
/// - the update log (buffering, flushing, sequence allocation)
/// - open documents and their incremental reload
/// - activity discovery (lazy reload, eager import)
/// - consolidation and moves
///
/// # Opening an engine
///
/// ```rust,ignore
/// use foldsync_core::{Config, Engine};
///
/// let engine = Engine::open(Config::new("state"), MyModel)?;
/// let root = engine.add_root(Path::new("/mnt/cloud/notes"))?;
/// let doc = engine.create_document(&root, None)?;
/// engine.apply_local_update(&doc, update_bytes)?;
/// engine.flush(&doc)?;
/// ```
pub struct Engine<M: DocumentModel> {
    config: Config,
    model: M,
    storage: Arc<dyn Storage>,
    state: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ctx: ReplicationContext,
    roots: Arc<RootRegistry>,
    index: Arc<DocumentIndex>,
    moves: MoveCoordinator,
    events: Arc<EventFeed>,
    buffer: UpdateBuffer,
    open: Mutex<HashMap<DocumentId, OpenDocument<M::Document>>>,
    cursors: Mutex<Cursors>,
    pending: Mutex<BTreeMap<DocumentId, PendingImport>>,
}

impl<M: DocumentModel> std::fmt::Debug for Engine<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instance", self.ctx.instance())
            .field("roots", &self.roots)
            .finish_non_exhaustive()
    }
}

impl<M: DocumentModel> Engine<M> {
    /// Opens an engine on the local filesystem.
    ///
    /// Locks `config.state_dir`, then runs startup recovery:
    /// - seals this instance's unfinished update files
    /// - resumes this instance's interrupted moves
    /// - retries imports still waiting for files
    ///
    /// # Errors
    ///
    /// - `StateLocked` if another engine uses the state directory
    /// - `InvalidState` if a state file is unreadable
    pub fn open(config: Config, model: M) -> CoreResult<Self> {
        let dir = InstanceDir::open(&config.state_dir)?;
        let instance = dir.instance_id().clone();
        let moves = FileMoveStore::open(&config.resolved_move_store_dir())?;
        let parts = EngineParts {
            storage: Arc::new(LocalStorage::new()),
            state: Arc::new(dir),
            moves: Arc::new(moves),
            clock: Arc::new(SystemClock),
            instance,
        };
        Self::open_with(config, model, parts)
    }

    /// Opens an engine with injected components.
    pub fn open_with(config: Config, model: M, parts: EngineParts) -> CoreResult<Self> {
        let EngineParts {
            storage,
            state,
            moves,
            clock,
            instance,
        } = parts;

        let roots = Arc::new(RootRegistry::new());
        let rows: Vec<RootRow> = load_cbor(state.as_ref(), ROOTS_STATE)?.unwrap_or_default();
        for row in rows {
            roots.insert(StorageRoot::known(row.id, row.path));
        }

        let index = Arc::new(DocumentIndex::load(state.clone())?);
        let ctx = ReplicationContext::load(instance.clone(), state.clone())?;
        let events = Arc::new(EventFeed::new());
        let coordinator = MoveCoordinator::new(
            storage.clone(),
            roots.clone(),
            index.clone(),
            moves,
            events.clone(),
            clock.clone(),
            instance.clone(),
            MovePolicy {
                max_attempts: config.max_move_attempts,
                stale_after: config.stale_after,
            },
        );

        let file: CursorFile = load_cbor(state.as_ref(), CURSORS_STATE)?.unwrap_or_default();
        let cursors = Cursors {
            readers: file
                .readers
                .into_iter()
                .map(|row| ((row.reader, row.document), row.cursor))
                .collect(),
            activity: file.activity,
        };
        let pending: Vec<PendingImport> =
            load_cbor(state.as_ref(), PENDING_STATE)?.unwrap_or_default();

        let engine = Self {
            buffer: UpdateBuffer::new(config.flush_policy),
            config,
            model,
            storage,
            state,
            clock,
            ctx,
            roots,
            index,
            moves: coordinator,
            events,
            open: Mutex::new(HashMap::new()),
            cursors: Mutex::new(cursors),
            pending: Mutex::new(
                pending
                    .into_iter()
                    .map(|p| (p.document_id.clone(), p))
                    .collect(),
            ),
        };
        engine.startup();
        tracing::info!(instance = %instance, documents = engine.index.list().len(), "engine opened");
        Ok(engine)
    }

    fn startup(&self) {
        for entry in self.index.list() {
            let Some(root) = self.roots.accessible(self.storage.as_ref(), &entry.root_id) else {
                continue;
            };
            let dirs = root.document(&entry.document_id);
            if let Err(err) = repair_drafts(
                &self.model,
                self.storage.as_ref(),
                &dirs,
                &entry.document_id,
                self.ctx.instance(),
            ) {
                tracing::warn!(document = %entry.document_id, error = %err, "draft repair failed");
            }
        }
        if let Err(err) = self.recover() {
            tracing::warn!(error = %err, "startup move recovery failed");
        }
        if let Err(err) = self.retry_pending() {
            tracing::warn!(error = %err, "retrying pending imports failed");
        }
    }

    /// This instance's id.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        self.ctx.instance()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The document model.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Roots and documents
    // ------------------------------------------------------------------

    /// Registers a storage root and imports the documents already in it.
    ///
    /// The root's identity file is created if missing.
    pub fn add_root(&self, path: &Path) -> CoreResult<RootId> {
        let root = StorageRoot::open_or_init(self.storage.as_ref(), path)?;
        self.roots.insert(root.clone());
        self.save_roots()?;

        for document in root.list_documents(self.storage.as_ref())? {
            if self.index.get(&document).is_some() {
                continue;
            }
            if !self.try_import(&document, &root)? {
                self.add_pending(&document, root.id())?;
            }
        }
        tracing::info!(root = %root.id(), path = %path.display(), "root registered");
        Ok(root.id().clone())
    }

    /// Registered roots.
    #[must_use]
    pub fn list_roots(&self) -> Vec<RootInfo> {
        self.roots
            .all()
            .into_iter()
            .map(|root| RootInfo {
                accessible: root.is_reachable(self.storage.as_ref()),
                id: root.id().clone(),
                path: root.path().to_path_buf(),
            })
            .collect()
    }

    /// Indexed documents.
    #[must_use]
    pub fn list_documents(&self) -> Vec<DocumentEntry> {
        self.index.list()
    }

    /// Index row of one document.
    #[must_use]
    pub fn document_entry(&self, document: &DocumentId) -> Option<DocumentEntry> {
        self.index.get(document)
    }

    /// Imports waiting for their files.
    #[must_use]
    pub fn pending_imports(&self) -> Vec<PendingImport> {
        self.pending.lock().values().cloned().collect()
    }

    /// Creates a new document in `root`.
    ///
    /// The empty document's full state is written as the first update, so
    /// the document exists on disk for every other instance from the start.
    pub fn create_document(&self, root: &RootId, folder: Option<String>) -> CoreResult<DocumentId> {
        let root = self.roots.require(self.storage.as_ref(), root)?;
        let document = DocumentId::new();
        let dirs = root.document(&document);
        dirs.create(self.storage.as_ref())?;

        let now = self.clock.now();
        let initial = self.model.new_document().encode_full_state();
        write_update(self.storage.as_ref(), &self.ctx, &dirs, &document, &initial, now)?;
        self.index.upsert(DocumentEntry {
            document_id: document.clone(),
            root_id: root.id().clone(),
            folder,
            created_at: now,
            modified_at: now,
        })?;
        activity::record(
            self.storage.as_ref(),
            &root,
            self.ctx.instance(),
            &document,
            ActivityKind::Created,
            now,
        )?;
        tracing::info!(document = %document, root = %root.id(), "document created");
        Ok(document)
    }

    // ------------------------------------------------------------------
    // Local updates
    // ------------------------------------------------------------------

    /// Accepts an update emitted by the editing layer.
    ///
    /// The update is applied to the open document (if any) and buffered; it
    /// is written when the flush policy says so.
    pub fn apply_local_update(&self, document: &DocumentId, update: Vec<u8>) -> CoreResult<()> {
        if self.index.get(document).is_none() {
            return Err(CoreError::document_not_found(document));
        }
        if let Some(open) = self.open.lock().get_mut(document) {
            open.document.apply_update(&update)?;
        }
        if self.buffer.append(document, update, self.clock.now()) {
            self.flush(document)?;
        }
        Ok(())
    }

    /// Writes a document's buffered updates. Returns the files written.
    pub fn flush(&self, document: &DocumentId) -> CoreResult<usize> {
        let updates = self.buffer.take(document);
        if updates.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();
        let root = match self.document_root(document) {
            Ok(root) => root,
            Err(err) => {
                self.buffer.restore(document, updates, now);
                return Err(err);
            }
        };
        let dirs = root.document(document);

        let payloads = if updates.len() > 1 {
            match self.model.merge_updates(&updates) {
                Some(merged) => vec![merged],
                None => updates,
            }
        } else {
            updates
        };

        let mut written = 0;
        for (i, payload) in payloads.iter().enumerate() {
            if let Err(err) =
                write_update(self.storage.as_ref(), &self.ctx, &dirs, document, payload, now)
            {
                self.buffer.restore(document, payloads[i..].to_vec(), now);
                return Err(err);
            }
            written += 1;
        }
        activity::record(
            self.storage.as_ref(),
            &root,
            self.ctx.instance(),
            document,
            ActivityKind::Updated,
            now,
        )?;
        tracing::debug!(document = %document, files = written, "flushed updates");
        Ok(written)
    }

    /// Flushes every document whose policy says so. Returns files written.
    pub fn flush_due(&self) -> CoreResult<usize> {
        let mut written = 0;
        for document in self.buffer.due(self.clock.now()) {
            match self.flush(&document) {
                Ok(n) => written += n,
                Err(err) => tracing::warn!(document = %document, error = %err, "flush failed"),
            }
        }
        Ok(written)
    }

    /// Flushes everything buffered.
    pub fn flush_all(&self) -> CoreResult<usize> {
        let mut written = 0;
        for document in self.buffer.buffered() {
            written += self.flush(&document)?;
        }
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Open documents
    // ------------------------------------------------------------------

    /// Loads a document into memory. Opening an open document is a no-op.
    pub fn open_document(&self, document: &DocumentId) -> CoreResult<()> {
        if self.open.lock().contains_key(document) {
            return Ok(());
        }
        let root = self.document_root(document)?;
        let mut loaded = loader::load(
            &self.model,
            self.storage.as_ref(),
            &root.document(document),
            document,
        )?;
        for update in self.buffer.peek(document) {
            loaded.document.apply_update(&update)?;
        }

        let mut open = self.open.lock();
        open.entry(document.clone()).or_insert(OpenDocument {
            document: loaded.document,
            cursor: loaded.cursor,
        });
        drop(open);
        self.events.emit(EngineEvent::DocumentOpened {
            document_id: document.clone(),
        });
        Ok(())
    }

    /// Runs `f` with an open document.
    ///
    /// # Errors
    ///
    /// `DocumentNotOpen` if the document was not opened.
    pub fn with_document<R>(
        &self,
        document: &DocumentId,
        f: impl FnOnce(&M::Document) -> R,
    ) -> CoreResult<R> {
        let open = self.open.lock();
        let open_doc = open
            .get(document)
            .ok_or_else(|| CoreError::document_not_open(document))?;
        Ok(f(&open_doc.document))
    }

    /// Returns true if the document is open.
    #[must_use]
    pub fn is_open(&self, document: &DocumentId) -> bool {
        self.open.lock().contains_key(document)
    }

    /// Flushes and unloads a document.
    pub fn close_document(&self, document: &DocumentId) -> CoreResult<()> {
        self.flush(document)?;
        self.open.lock().remove(document);
        Ok(())
    }

    /// Integrates files written since the document was last synced.
    ///
    /// Returns true if the document changed.
    pub fn sync_document(&self, document: &DocumentId) -> CoreResult<bool> {
        let root = self.document_root(document)?;
        let dirs = root.document(document);
        let mut open = self.open.lock();
        let open_doc = open
            .get_mut(document)
            .ok_or_else(|| CoreError::document_not_open(document))?;
        let outcome = loader::sync_into(
            &mut open_doc.document,
            self.storage.as_ref(),
            &dirs,
            document,
            &open_doc.cursor,
            false,
        )?;
        open_doc.cursor = outcome.cursor.clone();
        drop(open);

        let changed = outcome.changed();
        if changed {
            self.events.emit(EngineEvent::DocumentChanged {
                document_id: document.clone(),
            });
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Incremental readers
    // ------------------------------------------------------------------

    /// Reads what `reader` has not seen of a document.
    ///
    /// The reader's cursor is not advanced until [`Self::acknowledge`] is
    /// called with the returned cursor, so a reader that crashes before
    /// applying gets the same updates again.
    pub fn read_new_updates(&self, reader: &str, document: &DocumentId) -> CoreResult<NewUpdates> {
        let root = self.document_root(document)?;
        let since = self
            .cursors
            .lock()
            .readers
            .get(&(reader.to_string(), document.clone()))
            .cloned()
            .unwrap_or_default();
        loader::read_new_updates(self.storage.as_ref(), &root.document(document), document, &since)
    }

    /// Persists a reader's cursor.
    pub fn acknowledge(
        &self,
        reader: &str,
        document: &DocumentId,
        cursor: ReaderCursor,
    ) -> CoreResult<()> {
        let mut cursors = self.cursors.lock();
        cursors
            .readers
            .insert((reader.to_string(), document.clone()), cursor);
        self.save_cursors(&cursors)
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Reads other instances' activity logs in every accessible root and
    /// acts on the entries.
    ///
    /// The activity cursors advance only once every entry of the batch was
    /// handled. If one fails, the whole batch is read again on the next poll;
    /// handling an entry twice is harmless.
    pub fn poll_activity(&self) -> CoreResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let mut polled = self.cursors.lock().activity.clone();
        let mut entries = Vec::new();
        for root in self.roots.all() {
            if !root.is_reachable(self.storage.as_ref()) {
                continue;
            }
            entries.extend(activity::poll(
                self.storage.as_ref(),
                &root,
                self.ctx.instance(),
                &mut polled,
            )?);
        }

        report.entries = entries.len();
        for entry in &entries {
            if let Err(err) = self.handle_entry(entry, &mut report) {
                tracing::warn!(
                    document = %entry.document_id,
                    error = %err,
                    "activity entry failed, batch will be reread"
                );
                return Err(err);
            }
        }
        if !entries.is_empty() {
            let mut cursors = self.cursors.lock();
            cursors.activity = polled;
            self.save_cursors(&cursors)?;
        }
        report.pending = self.pending.lock().len();
        Ok(report)
    }

    fn handle_entry(&self, entry: &ActivityEntry, report: &mut DiscoveryReport) -> CoreResult<()> {
        let document = &entry.document_id;
        match self.index.root_of(document) {
            Some(current) if current == entry.root_id => {
                if self.is_open(document) && self.sync_document(document)? {
                    report.reloaded.push(document.clone());
                }
            }
            Some(_) if entry.kind == ActivityKind::Moved => {
                if self.try_reassign(document, &entry.root_id)? {
                    report.reassigned.push(document.clone());
                } else {
                    self.add_pending(document, &entry.root_id)?;
                }
            }
            Some(_) => {}
            None => {
                let Some(root) = self.roots.get(&entry.root_id) else {
                    return Ok(());
                };
                if self.try_import(document, &root)? {
                    report.imported.push(document.clone());
                } else {
                    self.add_pending(document, &entry.root_id)?;
                }
            }
        }
        Ok(())
    }

    /// Retries imports and reassignments still waiting for files.
    ///
    /// Returns the number resolved.
    pub fn retry_pending(&self) -> CoreResult<usize> {
        let waiting: Vec<PendingImport> = self.pending.lock().values().cloned().collect();
        let mut resolved = 0;
        for item in waiting {
            let done = match self.index.root_of(&item.document_id) {
                Some(current) if current == item.root_id => true,
                Some(_) => self.try_reassign(&item.document_id, &item.root_id)?,
                None => match self.roots.get(&item.root_id) {
                    Some(root) => self.try_import(&item.document_id, &root)?,
                    None => false,
                },
            };
            let mut pending = self.pending.lock();
            if done {
                pending.remove(&item.document_id);
                resolved += 1;
            } else if let Some(p) = pending.get_mut(&item.document_id) {
                p.attempts += 1;
            }
            self.save_pending(&pending)?;
        }
        Ok(resolved)
    }

    /// Registers an unknown document if its files are present.
    fn try_import(&self, document: &DocumentId, root: &StorageRoot) -> CoreResult<bool> {
        if !root.is_reachable(self.storage.as_ref()) || !self.has_data(root, document)? {
            return Ok(false);
        }
        let loaded = match loader::load(
            &self.model,
            self.storage.as_ref(),
            &root.document(document),
            document,
        ) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(document = %document, error = %err, "import deferred");
                return Ok(false);
            }
        };
        if !loaded.found_data() {
            return Ok(false);
        }
        let now = self.clock.now();
        self.index.upsert(DocumentEntry {
            document_id: document.clone(),
            root_id: root.id().clone(),
            folder: None,
            created_at: now,
            modified_at: now,
        })?;
        self.remove_pending(document)?;
        tracing::info!(document = %document, root = %root.id(), "imported document");
        self.events.emit(EngineEvent::DocumentImported {
            document_id: document.clone(),
            root_id: root.id().clone(),
        });
        Ok(true)
    }

    /// Follows a move announced by another instance once the document's
    /// directory is visible in the new root.
    fn try_reassign(&self, document: &DocumentId, to: &RootId) -> CoreResult<bool> {
        let Some(root) = self.roots.accessible(self.storage.as_ref(), to) else {
            return Ok(false);
        };
        if !self.has_data(&root, document)? {
            return Ok(false);
        }
        let Some(from) = self.index.root_of(document) else {
            return Ok(false);
        };
        let folder = self.index.get(document).and_then(|e| e.folder);
        self.index
            .reassign(document, &from, to, folder, self.clock.now())?;
        self.remove_pending(document)?;
        tracing::info!(document = %document, from = %from, to = %to, "followed move");
        self.events.emit(EngineEvent::DocumentMoved {
            document_id: document.clone(),
            from,
            to: to.clone(),
        });
        if self.is_open(document) {
            self.sync_document(document)?;
        }
        Ok(true)
    }

    fn has_data(&self, root: &StorageRoot, document: &DocumentId) -> CoreResult<bool> {
        let files = scan(self.storage.as_ref(), &root.document(document), document)?;
        let paths = files
            .snapshots
            .iter()
            .map(|s| &s.path)
            .chain(files.packs.iter().map(|p| &p.path))
            .chain(files.updates.iter().map(|u| &u.path));
        for path in paths {
            if matches!(read_payload(self.storage.as_ref(), path), Ok(Some(_))) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn add_pending(&self, document: &DocumentId, root: &RootId) -> CoreResult<()> {
        let mut pending = self.pending.lock();
        let now = self.clock.now();
        let item = pending
            .entry(document.clone())
            .or_insert_with(|| PendingImport {
                document_id: document.clone(),
                root_id: root.clone(),
                first_seen: now,
                attempts: 0,
            });
        item.root_id = root.clone();
        tracing::debug!(document = %document, root = %root, "document waiting for files");
        self.save_pending(&pending)
    }

    fn remove_pending(&self, document: &DocumentId) -> CoreResult<()> {
        let mut pending = self.pending.lock();
        if pending.remove(document).is_some() {
            self.save_pending(&pending)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consolidation
    // ------------------------------------------------------------------

    /// Packs this instance's update files in every accessible document.
    pub fn pack_all(&self) -> CoreResult<usize> {
        let policy = PackPolicy {
            min_age: self.config.pack_min_age,
            min_run: self.config.pack_min_run,
            compress: self.config.compress,
        };
        let now = self.clock.now();
        let mut packs = 0;
        for (document, root) in self.accessible_documents() {
            let dirs = root.document(&document);
            while pack_document(
                self.storage.as_ref(),
                &dirs,
                &document,
                self.ctx.instance(),
                policy,
                now,
            )?
            .is_some()
            {
                packs += 1;
            }
        }
        Ok(packs)
    }

    /// Writes due snapshots and collects garbage in every accessible
    /// document. Returns `(snapshots, files removed)`.
    pub fn snapshot_all(&self) -> CoreResult<(usize, usize)> {
        let policy = SnapshotPolicy {
            threshold: self.config.snapshot_threshold,
            compress: self.config.compress,
        };
        let now = self.clock.now();
        let (mut snapshots, mut removed) = (0, 0);
        for (document, root) in self.accessible_documents() {
            let dirs = root.document(&document);
            let instance = self.ctx.instance();
            if snapshot_document(
                &self.model,
                self.storage.as_ref(),
                &dirs,
                &document,
                instance,
                policy,
                now,
            )?
            .is_some()
            {
                snapshots += 1;
            }
            removed += collect_garbage(self.storage.as_ref(), &dirs, &document, instance)?;
        }
        Ok((snapshots, removed))
    }

    /// Flushes, packs, snapshots and collects garbage once.
    pub fn run_maintenance(&self) -> CoreResult<MaintenanceReport> {
        self.flush_all()?;
        let packs = self.pack_all()?;
        let (snapshots, removed) = self.snapshot_all()?;
        Ok(MaintenanceReport {
            packs,
            snapshots,
            removed,
        })
    }

    fn accessible_documents(&self) -> Vec<(DocumentId, StorageRoot)> {
        self.index
            .list()
            .into_iter()
            .filter_map(|entry| {
                self.roots
                    .accessible(self.storage.as_ref(), &entry.root_id)
                    .map(|root| (entry.document_id, root))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Moves
    // ------------------------------------------------------------------

    /// Moves a document to another root and runs the move as far as it
    /// goes.
    pub fn move_document(
        &self,
        document: &DocumentId,
        target: &RootId,
        folder: Option<String>,
    ) -> CoreResult<MoveRecord> {
        let record = self.begin_move(document, target, folder)?;
        self.moves.run(&record.move_id)
    }

    /// Creates a move record without running it.
    pub fn begin_move(
        &self,
        document: &DocumentId,
        target: &RootId,
        folder: Option<String>,
    ) -> CoreResult<MoveRecord> {
        self.flush(document)?;
        self.moves.start(document, target, folder)
    }

    /// Performs one step of an own move.
    pub fn step_move(&self, move_id: &MoveId) -> CoreResult<MoveRecord> {
        self.moves.step(move_id)
    }

    /// Runs an own move until it is terminal or blocked.
    pub fn resume_move(&self, move_id: &MoveId) -> CoreResult<MoveRecord> {
        self.moves.run(move_id)
    }

    /// Cancels a move before the index changed.
    pub fn cancel_move(&self, move_id: &MoveId) -> CoreResult<MoveRecord> {
        self.moves.cancel(move_id)
    }

    /// Takes over a stale move of another instance.
    pub fn take_over_move(&self, move_id: &MoveId, force: bool) -> CoreResult<MoveRecord> {
        self.moves.take_over(move_id, force)
    }

    /// All move records.
    pub fn list_moves(&self) -> CoreResult<Vec<MoveRecord>> {
        self.moves.store().list()
    }

    /// Runs one recovery pass over the move records.
    pub fn recover(&self) -> CoreResult<RecoveryReport> {
        self.moves.recover(self.config.move_retention)
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Starts the periodic tasks on a background thread.
    pub fn start_background(self: &Arc<Self>) -> CoreResult<BackgroundTasks> {
        BackgroundTasks::spawn(
            self.clone(),
            TaskScheduler::from_config(&self.config),
            self.clock.clone(),
        )
    }

    /// Flushes everything and releases the engine.
    pub fn close(self) -> CoreResult<()> {
        self.flush_all()?;
        tracing::info!(instance = %self.ctx.instance(), "engine closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn document_root(&self, document: &DocumentId) -> CoreResult<StorageRoot> {
        let root_id = self
            .index
            .root_of(document)
            .ok_or_else(|| CoreError::document_not_found(document))?;
        self.roots.require(self.storage.as_ref(), &root_id)
    }

    fn save_roots(&self) -> CoreResult<()> {
        let rows: Vec<RootRow> = self
            .roots
            .all()
            .into_iter()
            .map(|root| RootRow {
                id: root.id().clone(),
                path: root.path().to_path_buf(),
            })
            .collect();
        save_cbor(self.state.as_ref(), ROOTS_STATE, &rows)
    }

    fn save_cursors(&self, cursors: &Cursors) -> CoreResult<()> {
        let file = CursorFile {
            readers: cursors
                .readers
                .iter()
                .map(|((reader, document), cursor)| ReaderRow {
                    reader: reader.clone(),
                    document: document.clone(),
                    cursor: cursor.clone(),
                })
                .collect(),
            activity: cursors.activity.clone(),
        };
        save_cbor(self.state.as_ref(), CURSORS_STATE, &file)
    }

    fn save_pending(&self, pending: &BTreeMap<DocumentId, PendingImport>) -> CoreResult<()> {
        let rows: Vec<&PendingImport> = pending.values().collect();
        save_cbor(self.state.as_ref(), PENDING_STATE, &rows)
    }
}

impl<M: DocumentModel> TaskRunner for Engine<M> {
    fn run_task(&self, kind: TaskKind) -> CoreResult<()> {
        match kind {
            TaskKind::Flush => {
                self.flush_due()?;
            }
            TaskKind::Pack => {
                self.pack_all()?;
            }
            TaskKind::Snapshot => {
                self.snapshot_all()?;
            }
            TaskKind::Recovery => {
                self.recover()?;
                self.retry_pending()?;
            }
            TaskKind::ActivityPoll => {
                self.poll_activity()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FlushPolicy;
    use crate::document::testing::{GrowSet, GrowSetModel};
    use crate::move_store::MemoryMoveStore;
    use crate::moves::MoveState;
    use crate::state::MemoryStateStore;
    use foldsync_storage::MemoryStorage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// State store whose saves fail on demand, except for the cursors.
    #[derive(Debug, Default)]
    struct FailingState {
        inner: MemoryStateStore,
        failing: AtomicBool,
    }

    impl StateStore for FailingState {
        fn load(&self, name: &str) -> CoreResult<Option<Vec<u8>>> {
            self.inner.load(name)
        }

        fn save(&self, name: &str, data: &[u8]) -> CoreResult<()> {
            if self.failing.load(Ordering::SeqCst) && name != CURSORS_STATE {
                return Err(CoreError::invalid_state(name, "disk full"));
            }
            self.inner.save(name, data)
        }
    }

    struct Rig {
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        moves: Arc<MemoryMoveStore>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                storage: Arc::new(MemoryStorage::new()),
                clock: Arc::new(ManualClock::new(1_000_000)),
                moves: Arc::new(MemoryMoveStore::new()),
            }
        }

        fn engine(&self, instance: &str, state: Arc<dyn StateStore>) -> Engine<GrowSetModel> {
            let config = Config::new("unused")
                .flush_policy(FlushPolicy::Immediate)
                .pack_min_age(Duration::ZERO)
                .pack_min_run(2)
                .snapshot_threshold(3);
            Engine::open_with(
                config,
                GrowSetModel { mergeable: false },
                EngineParts {
                    storage: self.storage.clone(),
                    state,
                    moves: self.moves.clone(),
                    clock: self.clock.clone(),
                    instance: InstanceId::parse(instance).unwrap(),
                },
            )
            .unwrap()
        }
    }

    fn items(engine: &Engine<GrowSetModel>, doc: &DocumentId) -> Vec<u64> {
        engine
            .with_document(doc, |set: &GrowSet| set.items.iter().copied().collect())
            .unwrap()
    }

    #[test]
    fn create_write_and_reload() {
        let rig = Rig::new();
        let state = Arc::new(MemoryStateStore::new());
        let engine = rig.engine("inst-a", state.clone());
        let root = engine.add_root(Path::new("/r1")).unwrap();
        let doc = engine.create_document(&root, None).unwrap();
        engine.apply_local_update(&doc, GrowSet::update(&[1, 2])).unwrap();
        engine.apply_local_update(&doc, GrowSet::update(&[3])).unwrap();
        drop(engine);

        let engine = rig.engine("inst-a", state);
        engine.open_document(&doc).unwrap();
        assert_eq!(items(&engine, &doc), vec![1, 2, 3]);
        assert_eq!(engine.list_roots().len(), 1);
    }

    #[test]
    fn peers_discover_and_reload() {
        let rig = Rig::new();
        let a = rig.engine("inst-a", Arc::new(MemoryStateStore::new()));
        let b = rig.engine("inst-b", Arc::new(MemoryStateStore::new()));
        let root = a.add_root(Path::new("/shared")).unwrap();
        b.add_root(Path::new("/shared")).unwrap();

        let doc = a.create_document(&root, None).unwrap();
        let report = b.poll_activity().unwrap();
        assert_eq!(report.imported, vec![doc.clone()]);

        b.open_document(&doc).unwrap();
        a.apply_local_update(&doc, GrowSet::update(&[7])).unwrap();
        let report = b.poll_activity().unwrap();
        assert_eq!(report.reloaded, vec![doc.clone()]);
        assert_eq!(items(&b, &doc), vec![7]);
    }

    #[test]
    fn failed_entry_is_polled_again() {
        let rig = Rig::new();
        let state = Arc::new(FailingState::default());
        let a = rig.engine("inst-a", Arc::new(MemoryStateStore::new()));
        let b = rig.engine("inst-b", state.clone());
        let root = a.add_root(Path::new("/shared")).unwrap();
        b.add_root(Path::new("/shared")).unwrap();
        let doc = a.create_document(&root, None).unwrap();

        state.failing.store(true, Ordering::SeqCst);
        assert!(b.poll_activity().is_err());
        assert!(b.document_entry(&doc).is_none());

        state.failing.store(false, Ordering::SeqCst);
        let report = b.poll_activity().unwrap();
        assert_eq!(report.imported, vec![doc.clone()]);
        assert!(b.poll_activity().unwrap().imported.is_empty());
    }

    #[test]
    fn import_waits_for_files() {
        let rig = Rig::new();
        let a = rig.engine("inst-a", Arc::new(MemoryStateStore::new()));
        let b = rig.engine("inst-b", Arc::new(MemoryStateStore::new()));
        let root = a.add_root(Path::new("/shared")).unwrap();
        let doc = a.create_document(&root, None).unwrap();
        b.add_root(Path::new("/shared")).unwrap();
        assert_eq!(b.list_documents().len(), 1);

        // Files not synced yet: hide the document directory.
        let other = DocumentId::new();
        let r = StorageRoot::open(rig.storage.as_ref(), Path::new("/shared"))
            .unwrap()
            .unwrap();
        activity::record(
            rig.storage.as_ref(),
            &r,
            a.instance_id(),
            &other,
            ActivityKind::Created,
            1,
        )
        .unwrap();
        let report = b.poll_activity().unwrap();
        assert!(report.imported.is_empty());
        assert_eq!(report.pending, 1);

        let dirs = r.document(&other);
        crate::update_log::write_flagged(
            rig.storage.as_ref(),
            &dirs.updates().join(format!("inst-a_{}_1-1.upd", other.as_str())),
            &GrowSet::update(&[1]),
        )
        .unwrap();
        assert_eq!(b.retry_pending().unwrap(), 1);
        assert!(b.document_entry(&other).is_some());
        assert!(b.document_entry(&doc).is_some());
    }

    #[test]
    fn maintenance_keeps_content() {
        let rig = Rig::new();
        let engine = rig.engine("inst-a", Arc::new(MemoryStateStore::new()));
        let root = engine.add_root(Path::new("/r1")).unwrap();
        let doc = engine.create_document(&root, None).unwrap();
        for i in 0..6 {
            engine.apply_local_update(&doc, GrowSet::update(&[i])).unwrap();
        }
        let report = engine.run_maintenance().unwrap();
        assert!(report.packs >= 1);
        assert_eq!(report.snapshots, 1);

        engine.open_document(&doc).unwrap();
        assert_eq!(items(&engine, &doc), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn move_between_roots() {
        let rig = Rig::new();
        let engine = rig.engine("inst-a", Arc::new(MemoryStateStore::new()));
        let r1 = engine.add_root(Path::new("/r1")).unwrap();
        let r2 = engine.add_root(Path::new("/r2")).unwrap();
        let doc = engine.create_document(&r1, None).unwrap();
        engine.apply_local_update(&doc, GrowSet::update(&[4])).unwrap();

        let record = engine.move_document(&doc, &r2, None).unwrap();
        assert_eq!(record.state, MoveState::Completed);
        assert_eq!(engine.document_entry(&doc).unwrap().root_id, r2);
        engine.open_document(&doc).unwrap();
        assert_eq!(items(&engine, &doc), vec![4]);
        assert_eq!(engine.list_moves().unwrap().len(), 1);
    }

    #[test]
    fn readers_advance_only_when_acknowledged() {
        let rig = Rig::new();
        let engine = rig.engine("inst-a", Arc::new(MemoryStateStore::new()));
        let root = engine.add_root(Path::new("/r1")).unwrap();
        let doc = engine.create_document(&root, None).unwrap();

        let first = engine.read_new_updates("search", &doc).unwrap();
        assert_eq!(first.updates.len(), 1);
        let again = engine.read_new_updates("search", &doc).unwrap();
        assert_eq!(again.updates.len(), 1);

        engine.acknowledge("search", &doc, first.cursor).unwrap();
        assert!(engine.read_new_updates("search", &doc).unwrap().is_empty());
        engine.apply_local_update(&doc, GrowSet::update(&[9])).unwrap();
        assert_eq!(engine.read_new_updates("search", &doc).unwrap().updates.len(), 1);
    }

    #[test]
    fn unknown_documents_are_rejected() {
        let rig = Rig::new();
        let engine = rig.engine("inst-a", Arc::new(MemoryStateStore::new()));
        let err = engine
            .apply_local_update(&DocumentId::new(), vec![])
            .unwrap_err();
        assert!(matches!(err, CoreError::DocumentNotFound { .. }));
    }
}
