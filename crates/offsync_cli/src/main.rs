//! offsync CLI
//!
//! Maintenance tools for a file-backed offsync store.
//!
//! # Commands
//!
//! - `inspect` - Display store usage, collections and queue state
//! - `pending` - List queued changes
//! - `retry` - Put an exhausted change back in the queue
//! - `discard` - Drop a queued change
//! - `clear` - Remove every record of a collection
//! - `compact` - Rewrite the journal as a snapshot

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// offsync store maintenance tools.
#[derive(Parser)]
#[command(name = "offsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Display store usage, collections and queue state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued changes
    Pending {
        /// Only show changes of this endpoint
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Put a change back in the queue with a fresh retry budget
    Retry {
        /// Change id
        change_id: String,
    },

    /// Drop a queued change and its conflict
    Discard {
        /// Change id
        change_id: String,
    },

    /// Remove every record of a collection
    Clear {
        /// Collection name
        collection: String,
    },

    /// Rewrite the journal as a single snapshot
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Pending { endpoint, format } => {
            let path = cli.path.ok_or("Store path required for pending")?;
            commands::pending::run(&path, endpoint.as_deref(), &format)?;
        }
        Commands::Retry { change_id } => {
            let path = cli.path.ok_or("Store path required for retry")?;
            commands::retry::run(&path, &change_id)?;
        }
        Commands::Discard { change_id } => {
            let path = cli.path.ok_or("Store path required for discard")?;
            commands::discard::run(&path, &change_id)?;
        }
        Commands::Clear { collection } => {
            let path = cli.path.ok_or("Store path required for clear")?;
            commands::clear::run(&path, &collection)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("offsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Journal format v{}", offsync_storage::JOURNAL_VERSION);
        }
    }

    Ok(())
}
