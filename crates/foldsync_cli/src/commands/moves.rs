//! Moves command implementation.
//!
//! `list` only reads the move store. The other subcommands act as the
//! instance owning `--state`, which takes that instance's lock: they fail
//! while the instance is running.

use super::{open_root, Format};
use foldsync_core::{
    Config, DocumentIndex, EventFeed, FileMoveStore, InstanceDir, MoveCoordinator, MoveId,
    MovePolicy, MoveRecord, MoveStore, RootRegistry, SystemClock,
};
use foldsync_storage::{LocalStorage, Storage};
use std::path::PathBuf;
use std::sync::Arc;

/// Where the move records and instance state live.
#[derive(Debug, Clone)]
pub struct MoveContext {
    /// Instance state directory.
    pub state_dir: PathBuf,
    /// Move store, when kept outside the state directory.
    pub move_store_dir: Option<PathBuf>,
    /// Storage roots the instance can reach.
    pub roots: Vec<PathBuf>,
}

impl MoveContext {
    fn config(&self) -> Config {
        Config {
            state_dir: self.state_dir.clone(),
            move_store_dir: self.move_store_dir.clone(),
            ..Config::default()
        }
    }

    fn store(&self) -> Result<FileMoveStore, Box<dyn std::error::Error>> {
        Ok(FileMoveStore::open(&self.config().resolved_move_store_dir())?)
    }

    /// Builds a coordinator acting as the instance owning the state directory.
    pub fn coordinator(
        &self,
        storage: Arc<dyn Storage>,
    ) -> Result<MoveCoordinator, Box<dyn std::error::Error>> {
        let config = self.config();
        let dir = InstanceDir::open(&config.state_dir)?;
        let instance = dir.instance_id().clone();
        let index = Arc::new(DocumentIndex::load(Arc::new(dir))?);

        let roots = Arc::new(RootRegistry::new());
        for path in &self.roots {
            roots.insert(open_root(storage.as_ref(), path)?);
        }

        Ok(MoveCoordinator::new(
            storage,
            roots,
            index,
            Arc::new(self.store()?),
            Arc::new(EventFeed::new()),
            Arc::new(SystemClock),
            instance,
            MovePolicy {
                max_attempts: config.max_move_attempts,
                stale_after: config.stale_after,
            },
        ))
    }
}

/// Lists move records, active ones only unless `all`.
pub fn list(
    context: &MoveContext,
    all: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let format = Format::parse(format)?;
    let store = context.store()?;
    let records = if all { store.list()? } else { store.active()? };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        Format::Text => {
            if records.is_empty() {
                println!("No moves");
            }
            for record in &records {
                print_record(record);
            }
        }
    }
    Ok(())
}

/// Drives an owned move as far as it goes.
pub fn resume(context: &MoveContext, move_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = context.coordinator(Arc::new(LocalStorage::new()))?;
    let record = coordinator.run(&MoveId::parse(move_id)?)?;
    print_record(&record);
    Ok(())
}

/// Cancels an owned move that has not touched the index yet.
pub fn cancel(context: &MoveContext, move_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = context.coordinator(Arc::new(LocalStorage::new()))?;
    let record = coordinator.cancel(&MoveId::parse(move_id)?)?;
    print_record(&record);
    Ok(())
}

/// Takes over a stale move of another instance, then resumes it.
pub fn take_over(
    context: &MoveContext,
    move_id: &str,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = context.coordinator(Arc::new(LocalStorage::new()))?;
    let move_id = MoveId::parse(move_id)?;
    coordinator.take_over(&move_id, force)?;
    let record = coordinator.run(&move_id)?;
    print_record(&record);
    Ok(())
}

fn print_record(record: &MoveRecord) {
    println!(
        "{}  {}  {} -> {}  [{}] owner={} attempts={}",
        record.move_id,
        record.document_id,
        record.source_root_id,
        record.target_root_id,
        record.state,
        record.initiating_instance,
        record.attempts
    );
    if let Some(error) = &record.error {
        println!("    last error: {error}");
    }
}
