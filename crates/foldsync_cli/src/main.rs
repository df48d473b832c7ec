//! foldsync CLI
//!
//! Command-line tools for inspecting and repairing foldsync storage roots.
//!
//! # Commands
//!
//! - `inspect` - Summarize a root's documents and files
//! - `verify` - Classify every data file as complete, incomplete or malformed
//! - `pack` - Pack one instance's loose updates
//! - `activity` - Dump the activity logs of a root
//! - `moves` - List, resume, cancel or take over cross-root moves

mod commands;

use clap::{Parser, Subcommand};
use commands::moves::MoveContext;
use commands::pack::PackOptions;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// foldsync command-line tools.
#[derive(Parser)]
#[command(name = "foldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the storage root
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a root's documents and files
    Inspect {
        /// Only this document
        #[arg(short, long)]
        document: Option<String>,

        /// List individual file names
        #[arg(long)]
        files: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Classify every data file of a root
    Verify {
        /// Only this document
        #[arg(short, long)]
        document: Option<String>,
    },

    /// Pack an instance's loose updates
    Pack {
        /// Instance whose updates are packed
        #[arg(short, long)]
        instance: String,

        /// Only this document
        #[arg(short, long)]
        document: Option<String>,

        /// Shortest run worth a pack
        #[arg(long, default_value = "10")]
        min_run: usize,

        /// Leave updates younger than this many seconds alone
        #[arg(long, default_value = "60")]
        min_age: u64,

        /// Write uncompressed packs
        #[arg(long)]
        no_compress: bool,

        /// Delete files superseded by packs and snapshots
        #[arg(long)]
        gc: bool,
    },

    /// Dump the activity logs of a root
    Activity {
        /// Only this instance's log
        #[arg(short, long)]
        instance: Option<String>,

        /// Show only the last N entries
        #[arg(short, long)]
        tail: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Manage cross-root moves
    Moves {
        /// Instance state directory
        #[arg(short, long, default_value = ".foldsync")]
        state: PathBuf,

        /// Move store directory (defaults to <state>/moves)
        #[arg(long)]
        move_store: Option<PathBuf>,

        /// Storage roots reachable from this machine
        #[arg(short, long = "root")]
        roots: Vec<PathBuf>,

        #[command(subcommand)]
        action: MoveAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum MoveAction {
    /// List move records
    List {
        /// Include finished moves
        #[arg(short, long)]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Drive one of this instance's moves as far as it goes
    Resume {
        /// Move id
        move_id: String,
    },

    /// Cancel a move that has not changed the index yet
    Cancel {
        /// Move id
        move_id: String,
    },

    /// Take over a stalled move of another instance
    TakeOver {
        /// Move id
        move_id: String,

        /// Take over even if the owner was active recently
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            document,
            files,
            format,
        } => {
            let path = cli.path.ok_or("Root path required for inspect")?;
            commands::inspect::run(&path, document.as_deref(), files, &format)?;
        }
        Commands::Verify { document } => {
            let path = cli.path.ok_or("Root path required for verify")?;
            commands::verify::run(&path, document.as_deref())?;
        }
        Commands::Pack {
            instance,
            document,
            min_run,
            min_age,
            no_compress,
            gc,
        } => {
            let path = cli.path.ok_or("Root path required for pack")?;
            let options = PackOptions {
                instance,
                document,
                min_run,
                min_age: Duration::from_secs(min_age),
                compress: !no_compress,
                gc,
            };
            commands::pack::run(&path, &options)?;
        }
        Commands::Activity {
            instance,
            tail,
            format,
        } => {
            let path = cli.path.ok_or("Root path required for activity")?;
            commands::activity::run(&path, instance.as_deref(), tail, &format)?;
        }
        Commands::Moves {
            state,
            move_store,
            mut roots,
            action,
        } => {
            roots.extend(cli.path);
            let context = MoveContext {
                state_dir: state,
                move_store_dir: move_store,
                roots,
            };
            match action {
                MoveAction::List { all, format } => commands::moves::list(&context, all, &format)?,
                MoveAction::Resume { move_id } => commands::moves::resume(&context, &move_id)?,
                MoveAction::Cancel { move_id } => commands::moves::cancel(&context, &move_id)?,
                MoveAction::TakeOver { move_id, force } => {
                    commands::moves::take_over(&context, &move_id, force)?;
                }
            }
        }
        Commands::Version => {
            println!("foldsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "File format: flag byte {:#04x} draft / {:#04x} complete",
                foldsync_codec::envelope::FLAG_DRAFT,
                foldsync_codec::envelope::FLAG_COMPLETE
            );
        }
    }

    Ok(())
}
