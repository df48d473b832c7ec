//! Crash recovery testing for moves.
//!
//! A move is driven step by step to a persisted state, the instance is
//! crashed (dropped without any cleanup) and restarted, and the outcome is
//! checked. Whatever the crash point, a move must end in exactly one of two
//! shapes:
//!
//! - **completed**: the index names the target, the document lives only in
//!   the target root, no staging directory is left
//! - **rolled back**: the index names the source, the document lives only
//!   in the source root, no staging directory is left
//!
//! In both cases the document's content is unchanged.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use foldsync_testkit::crash::MoveCrashHarness;
//!
//! let mut harness = MoveCrashHarness::new();
//! assert!(harness.run_all(), "{}", harness.summary_json());
//! ```

use crate::fixtures::scenarios::{self, TwoRoots};
use foldsync_core::{
    CoreResult, DocumentId, MemoryStateStore, MoveId, MoveRecord, MoveState, RootId, StorageRoot,
};
use foldsync_storage::Storage;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Every persisted state a process can die in.
pub const CRASH_STATES: [MoveState; 6] = [
    MoveState::Initiated,
    MoveState::Copying,
    MoveState::FilesCopied,
    MoveState::DbUpdated,
    MoveState::Cleaning,
    MoveState::Completed,
];

const CHUNKS: [&str; 4] = ["alpha ", "beta ", "gamma ", "delta"];

/// Result of one crash scenario.
#[derive(Debug, Clone, Serialize)]
pub struct MoveCrashResult {
    /// Whether the outcome was consistent.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// State persisted when the instance died.
    pub crashed_in: MoveState,
    /// State after restart and recovery.
    pub final_state: Option<MoveState>,
    /// What went wrong, if anything.
    pub error: Option<String>,
}

impl MoveCrashResult {
    /// Creates a passing result.
    pub fn pass(description: &str, crashed_in: MoveState, final_state: MoveState) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            crashed_in,
            final_state: Some(final_state),
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(
        description: &str,
        crashed_in: MoveState,
        final_state: Option<MoveState>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            crashed_in,
            final_state,
            error: Some(error.into()),
        }
    }
}

/// Test harness for crash recovery of moves.
#[derive(Debug, Default)]
pub struct MoveCrashHarness {
    /// Results of the scenarios run so far.
    pub results: Vec<MoveCrashResult>,
}

impl MoveCrashHarness {
    /// Creates an empty harness.
    pub fn new() -> Self {
        Self::default()
    }

    /// Crashes a move once `state` is persisted and checks recovery.
    pub fn crash_at(&mut self, state: MoveState) -> &MoveCrashResult {
        let description = format!("crash in {state}");
        let result = Self::scenario(&description, state, |_, _| Ok(()));
        self.push(result)
    }

    /// Crashes while files are being copied: the staging directory holds a
    /// torn copy when the instance dies.
    pub fn crash_mid_copy(&mut self) -> &MoveCrashResult {
        let result = Self::scenario(
            "crash with a torn staging copy",
            MoveState::Copying,
            |fx, record| {
                let target = root_at(fx, "/r2")?;
                let staging = target.staging(&record.move_id);
                staging.create(fx.storage.as_ref())?;
                let torn = staging.updates().join(format!(
                    "{}_{}_1-1.upd",
                    record.initiating_instance,
                    record.document_id
                ));
                fx.storage
                    .write_new(&torn, &foldsync_codec::envelope::draft(b"half"))?;
                Ok(())
            },
        );
        self.push(result)
    }

    /// Runs every crash point plus the torn copy. Returns true if all
    /// passed.
    pub fn run_all(&mut self) -> bool {
        for state in CRASH_STATES {
            self.crash_at(state);
        }
        self.crash_mid_copy();
        self.all_passed()
    }

    /// Returns true if every recorded scenario passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Results as pretty JSON, for assertion messages.
    pub fn summary_json(&self) -> String {
        serde_json::to_string_pretty(&self.results).unwrap_or_default()
    }

    fn push(&mut self, result: MoveCrashResult) -> &MoveCrashResult {
        self.results.push(result);
        &self.results[self.results.len() - 1]
    }

    fn scenario<F>(description: &str, crash_in: MoveState, before_crash: F) -> MoveCrashResult
    where
        F: FnOnce(&TwoRoots, &MoveRecord) -> CoreResult<()>,
    {
        let mut fx = scenarios::two_roots("inst-a", Arc::new(MemoryStateStore::new()));
        let document = scenarios::document_with_text(&fx.instance, &fx.r1, &CHUNKS);
        let expected = CHUNKS.concat();

        let record = match drive_to(&fx, &document, crash_in) {
            Ok(record) => record,
            Err(err) => return MoveCrashResult::fail(description, crash_in, None, err),
        };
        if let Err(err) = before_crash(&fx, &record) {
            return MoveCrashResult::fail(description, crash_in, None, err.to_string());
        }

        fx.instance.crash();
        fx.instance.restart();

        match verify(&fx, &document, &record.move_id, &expected) {
            Ok(final_state) => MoveCrashResult::pass(description, crash_in, final_state),
            Err((final_state, err)) => {
                MoveCrashResult::fail(description, crash_in, final_state, err)
            }
        }
    }
}

fn drive_to(fx: &TwoRoots, document: &DocumentId, state: MoveState) -> Result<MoveRecord, String> {
    let engine = fx.instance.engine();
    let mut record = engine
        .begin_move(document, &fx.r2, None)
        .map_err(|e| e.to_string())?;
    while record.state != state {
        if record.state.is_terminal() {
            return Err(format!("move ended in {} before reaching {state}", record.state));
        }
        record = engine.step_move(&record.move_id).map_err(|e| e.to_string())?;
    }
    Ok(record)
}

fn root_at(fx: &TwoRoots, path: &str) -> CoreResult<StorageRoot> {
    StorageRoot::open(fx.storage.as_ref(), Path::new(path))?.ok_or_else(|| {
        foldsync_core::CoreError::invalid_operation(format!("no root at {path}"))
    })
}

fn verify(
    fx: &TwoRoots,
    document: &DocumentId,
    move_id: &MoveId,
    expected: &str,
) -> Result<MoveState, (Option<MoveState>, String)> {
    let engine = fx.instance.engine();
    let record = engine
        .list_moves()
        .map_err(|e| (None, e.to_string()))?
        .into_iter()
        .find(|r| &r.move_id == move_id)
        .ok_or_else(|| (None, "move record disappeared".to_string()))?;
    let state = record.state;
    let fail = |message: String| (Some(state), message);

    let (home, away): (&RootId, &str) = match state {
        MoveState::Completed => (&fx.r2, "/r1"),
        MoveState::RolledBack => (&fx.r1, "/r2"),
        other => return Err(fail(format!("move left in {other}"))),
    };

    let entry = engine
        .document_entry(document)
        .ok_or_else(|| fail("document missing from index".into()))?;
    if &entry.root_id != home {
        return Err(fail(format!("index names {} instead of {home}", entry.root_id)));
    }

    let storage = fx.storage.as_ref();
    let away_root = root_at(fx, away).map_err(|e| fail(e.to_string()))?;
    if storage.is_dir(away_root.document(document).base()) {
        return Err(fail(format!("document still present in {away}")));
    }
    for path in ["/r1", "/r2"] {
        let root = root_at(fx, path).map_err(|e| fail(e.to_string()))?;
        let staging = root
            .list_staging(storage)
            .map_err(|e| fail(e.to_string()))?;
        if !staging.is_empty() {
            return Err(fail(format!("staging left in {path}: {staging:?}")));
        }
    }

    let text = fx
        .instance
        .fresh_text(document)
        .map_err(|e| fail(e.to_string()))?;
    if text != expected {
        return Err(fail(format!("content changed: {text:?}")));
    }
    Ok(state)
}
