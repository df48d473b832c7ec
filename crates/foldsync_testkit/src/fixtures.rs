//! Test fixtures and engine helpers.
//!
//! Provides instances that can be crashed and restarted over the same
//! storage and state, temporary on-disk engines, and common scenarios.

use crate::model::{TextEditor, YrsModel};
use foldsync_core::{
    Config, CoreError, CoreResult, DocumentId, Engine, EngineParts, FlushPolicy, InstanceId,
    ManualClock, MemoryMoveStore, MemoryStateStore, RootId, StateStore,
};
use foldsync_storage::Storage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Name of the document index blob in an instance's state store.
pub const INDEX_STATE: &str = "index.cbor";

/// Start time of every manual clock handed out here.
pub const EPOCH: u64 = 1_700_000_000_000;

/// Configuration that makes every effect observable right away.
///
/// Updates are written immediately, any two loose updates form a pack and
/// three changes trigger a snapshot.
pub fn test_config() -> Config {
    Config::new("unused")
        .flush_policy(FlushPolicy::Immediate)
        .pack_min_age(Duration::ZERO)
        .pack_min_run(2)
        .snapshot_threshold(3)
}

/// A fresh manual clock at [`EPOCH`].
pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(EPOCH))
}

/// One simulated instance of the application.
///
/// The engine can be dropped without flushing ([`Self::crash`]) and opened
/// again over the same storage, state and move store ([`Self::restart`]),
/// which is how a process death looks to the next run.
pub struct TestInstance {
    config: Config,
    parts: EngineParts,
    engine: Option<Engine<YrsModel>>,
    editors: Mutex<HashMap<DocumentId, TextEditor>>,
}

impl TestInstance {
    /// Creates an instance named `name` with in-memory state.
    pub fn new(name: &str, storage: Arc<dyn Storage>, clock: Arc<ManualClock>) -> Self {
        Self::with_state(name, storage, clock, Arc::new(MemoryStateStore::new()))
    }

    /// Creates an instance over an explicit state store.
    pub fn with_state(
        name: &str,
        storage: Arc<dyn Storage>,
        clock: Arc<ManualClock>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        let parts = EngineParts {
            storage,
            state,
            moves: Arc::new(MemoryMoveStore::new()),
            clock,
            instance: InstanceId::parse(name).expect("Invalid instance name"),
        };
        Self::with_parts(test_config(), parts)
    }

    /// Creates an instance from explicit parts.
    pub fn with_parts(config: Config, parts: EngineParts) -> Self {
        let mut instance = Self {
            config,
            parts,
            engine: None,
            editors: Mutex::new(HashMap::new()),
        };
        instance.restart();
        instance
    }

    /// The running engine.
    pub fn engine(&self) -> &Engine<YrsModel> {
        self.engine.as_ref().expect("Instance is not running")
    }

    /// Drops the engine without flushing anything.
    pub fn crash(&mut self) {
        self.engine = None;
        self.editors.lock().clear();
    }

    /// Crashes (if running) and opens the engine again. Startup recovery
    /// runs as part of opening.
    pub fn restart(&mut self) -> &Engine<YrsModel> {
        self.crash();
        let engine = Engine::open_with(self.config.clone(), YrsModel, self.parts.clone())
            .expect("Failed to open engine");
        self.engine.insert(engine)
    }

    /// This instance's id.
    pub fn id(&self) -> &InstanceId {
        &self.parts.instance
    }

    /// The storage this instance sees.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.parts.storage
    }

    /// Registers a root at `path`.
    pub fn add_root(&self, path: &str) -> RootId {
        self.engine()
            .add_root(Path::new(path))
            .expect("Failed to add root")
    }

    /// Creates a document in `root`.
    pub fn create_document(&self, root: &RootId) -> DocumentId {
        self.engine()
            .create_document(root, None)
            .expect("Failed to create document")
    }

    /// Appends `chunk` to a document's text through this instance's editor.
    pub fn append(&self, document: &DocumentId, chunk: &str) -> CoreResult<()> {
        let update = self
            .editors
            .lock()
            .entry(document.clone())
            .or_default()
            .append(chunk);
        self.engine().apply_local_update(document, update)
    }

    /// Current text of a document, opening or syncing it first.
    pub fn text(&self, document: &DocumentId) -> CoreResult<String> {
        let engine = self.engine();
        if engine.is_open(document) {
            engine.sync_document(document)?;
        } else {
            engine.open_document(document)?;
        }
        engine.with_document(document, |doc| doc.text())
    }

    /// Text of a document loaded from scratch, bypassing any open replica.
    pub fn fresh_text(&self, document: &DocumentId) -> CoreResult<String> {
        let engine = self.engine();
        if engine.is_open(document) {
            engine.close_document(document)?;
        }
        self.text(document)
    }
}

impl std::fmt::Debug for TestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestInstance")
            .field("instance", &self.parts.instance)
            .field("running", &self.engine.is_some())
            .finish()
    }
}

/// A state store whose saves can be made to fail.
///
/// Used to make the index transaction of a move fail.
#[derive(Debug, Default)]
pub struct FaultyStateStore {
    inner: MemoryStateStore,
    failures: Mutex<HashMap<String, usize>>,
}

impl FaultyStateStore {
    /// Creates an empty store that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` saves of blob `name` fail.
    pub fn fail_next_saves(&self, name: &str, count: usize) {
        self.failures.lock().insert(name.to_string(), count);
    }

    /// Saves of `name` that are still going to fail.
    pub fn remaining_failures(&self, name: &str) -> usize {
        self.failures.lock().get(name).copied().unwrap_or(0)
    }
}

impl StateStore for FaultyStateStore {
    fn load(&self, name: &str) -> CoreResult<Option<Vec<u8>>> {
        self.inner.load(name)
    }

    fn save(&self, name: &str, data: &[u8]) -> CoreResult<()> {
        if let Some(left) = self.failures.lock().get_mut(name) {
            if *left > 0 {
                *left -= 1;
                return Err(CoreError::invalid_state(name, "injected save failure"));
            }
        }
        self.inner.save(name, data)
    }
}

/// An engine on the real filesystem with automatic cleanup.
pub struct TempEngine {
    /// The engine.
    pub engine: Engine<YrsModel>,
    /// A registered root inside the temporary directory.
    pub root: RootId,
    /// The temporary directory (kept alive to prevent cleanup).
    pub dir: TempDir,
}

impl TempEngine {
    /// Opens an engine with state in `<tmp>/state` and one root in
    /// `<tmp>/notes`.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = Config {
            state_dir: dir.path().join("state"),
            ..test_config()
        };
        let engine = Engine::open(config, YrsModel).expect("Failed to open engine");
        let root = engine
            .add_root(&dir.path().join("notes"))
            .expect("Failed to add root");
        Self { engine, root, dir }
    }
}

impl Default for TempEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test with an engine over a temporary directory.
///
/// # Example
///
/// ```rust,ignore
/// use foldsync_testkit::with_temp_engine;
///
/// #[test]
/// fn my_test() {
///     with_temp_engine(|engine, root| {
///         let doc = engine.create_document(root, None).unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&Engine<YrsModel>, &RootId) -> R,
{
    let temp = TempEngine::new();
    f(&temp.engine, &temp.root)
}

/// Common scenarios.
pub mod scenarios {
    use super::*;
    use foldsync_storage::MemoryStorage;

    /// One instance holding two roots, `/r1` and `/r2`, in memory.
    pub struct TwoRoots {
        /// Shared storage.
        pub storage: Arc<MemoryStorage>,
        /// Shared clock.
        pub clock: Arc<ManualClock>,
        /// The instance.
        pub instance: TestInstance,
        /// Root at `/r1`.
        pub r1: RootId,
        /// Root at `/r2`.
        pub r2: RootId,
    }

    /// Builds [`TwoRoots`] for instance `name` over `state`.
    pub fn two_roots(name: &str, state: Arc<dyn StateStore>) -> TwoRoots {
        let storage = Arc::new(MemoryStorage::new());
        let clock = test_clock();
        let instance = TestInstance::with_state(name, storage.clone(), clock.clone(), state);
        let r1 = instance.add_root("/r1");
        let r2 = instance.add_root("/r2");
        TwoRoots {
            storage,
            clock,
            instance,
            r1,
            r2,
        }
    }

    /// Creates a document in `root` and appends each chunk as its own
    /// update.
    pub fn document_with_text(
        instance: &TestInstance,
        root: &RootId,
        chunks: &[&str],
    ) -> DocumentId {
        let document = instance.create_document(root);
        for chunk in chunks {
            instance
                .append(&document, chunk)
                .expect("Failed to apply update");
        }
        document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_keeps_content() {
        let mut fx = scenarios::two_roots("inst-a", Arc::new(MemoryStateStore::new()));
        let doc = scenarios::document_with_text(&fx.instance, &fx.r1, &["a", "b"]);
        fx.instance.restart();
        assert_eq!(fx.instance.text(&doc).unwrap(), "ab");
        assert_eq!(fx.instance.engine().list_roots().len(), 2);
    }

    #[test]
    fn faulty_store_fails_the_requested_number_of_times() {
        let store = FaultyStateStore::new();
        store.fail_next_saves(INDEX_STATE, 2);
        assert!(store.save(INDEX_STATE, b"x").is_err());
        assert!(store.save("other", b"x").is_ok());
        assert!(store.save(INDEX_STATE, b"x").is_err());
        assert!(store.save(INDEX_STATE, b"x").is_ok());
        assert_eq!(store.load(INDEX_STATE).unwrap(), Some(b"x".to_vec()));
        assert_eq!(store.remaining_failures(INDEX_STATE), 0);
    }

    #[test]
    fn temp_engine_roundtrip() {
        with_temp_engine(|engine, root| {
            let doc = engine.create_document(root, None).unwrap();
            let mut editor = TextEditor::new();
            engine
                .apply_local_update(&doc, editor.append("on disk"))
                .unwrap();
            engine.open_document(&doc).unwrap();
            let text = engine.with_document(&doc, |d| d.text()).unwrap();
            assert_eq!(text, "on disk");
        });
    }
}
