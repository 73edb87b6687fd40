//! opsync CLI
//!
//! Operator tools for the journal of an opsync server. Stop the server
//! first; the journal is locked while a server has it open.
//!
//! # Commands
//!
//! - `inspect` - Display users, devices and journal statistics
//! - `verify` - Verify journal integrity
//! - `dump-journal` - Dump journal frames for debugging
//! - `compact` - Rewrite the journal to reclaim space
//! - `sweep` - Run a retention sweep

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// opsync command-line journal tools.
#[derive(Parser)]
#[command(name = "opsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the server data directory
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
    /// Display users, devices and journal statistics
    Inspect {
        /// Show per-device delivery state
        #[arg(short, long)]
        devices: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify,

    /// Dump journal frames for debugging
    DumpJournal {
        /// Maximum number of frames to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Only show frames of this user
        #[arg(short, long)]
        user: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewrite the journal to reclaim space
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Prune operations confirmed by every active device
    Sweep {
        /// Minimum age of a pruned operation, in seconds
        #[arg(long)]
        grace_secs: Option<u64>,

        /// Inactivity after which a device stops blocking pruning, in days
        #[arg(long)]
        stale_days: Option<u64>,

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
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { devices, format } => {
            let path = cli.path.ok_or("Data directory required for inspect")?;
            commands::inspect::run(&path, devices, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Data directory required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::DumpJournal {
            limit,
            offset,
            user,
            format,
        } => {
            let path = cli.path.ok_or("Data directory required for dump-journal")?;
            commands::dump_journal::run(&path, limit, offset, user.as_deref(), &format)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Data directory required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Sweep {
            grace_secs,
            stale_days,
            dry_run,
        } => {
            let path = cli.path.ok_or("Data directory required for sweep")?;
            commands::sweep::run(&path, grace_secs, stale_days, dry_run)?;
        }
        Commands::Version => {
            println!("opsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("journal format v{}", opsync_core::journal::JOURNAL_VERSION);
        }
    }

    Ok(())
}
