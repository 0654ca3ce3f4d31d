//! evlog CLI
//!
//! Runs a segment server and inspects its volume.
//!
//! # Commands
//!
//! - `serve` - Run a segment server
//! - `inspect` - Display the blocks of a volume
//! - `dump-wal` - Dump WAL records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// evlog segment server and volume tools.
#[derive(Parser)]
#[command(name = "evlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a segment server
    Serve {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on and advertise
        #[arg(long)]
        ip: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Volume directory
        #[arg(long)]
        volume_dir: Option<PathBuf>,

        /// Volume id
        #[arg(long)]
        volume_id: Option<u64>,

        /// Controller address, repeatable
        #[arg(long = "controller")]
        controllers: Vec<String>,

        /// Skip controller registration and heartbeats
        #[arg(long)]
        debug_mode: bool,
    },

    /// Display the blocks of a volume
    Inspect {
        /// Volume directory
        #[arg(short, long)]
        path: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump WAL records for debugging
    DumpWal {
        /// Volume directory
        #[arg(short, long)]
        path: PathBuf,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only records of this block
        #[arg(short, long)]
        block: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            config,
            ip,
            port,
            volume_dir,
            volume_id,
            controllers,
            debug_mode,
        } => {
            let overrides = commands::serve::Overrides {
                ip,
                port,
                volume_dir,
                volume_id,
                controllers,
                debug_mode,
            };
            commands::serve::run(config.as_deref(), overrides)?;
        }
        Commands::Inspect { path, format } => {
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpWal {
            path,
            limit,
            block,
            format,
        } => {
            commands::dump_wal::run(&path, limit, block, &format)?;
        }
    }

    Ok(())
}
