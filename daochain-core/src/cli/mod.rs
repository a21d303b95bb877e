//! CLI module for the DAO chain node

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::storage::Storage;

#[derive(Parser)]
#[command(name = "daochain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Single-writer token ledger with DAO governance.", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default genesis.toml into a data directory
    Init {
        /// Directory to store node data (default: ~/.daochain)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing genesis.toml
        #[arg(long)]
        force: bool,
    },

    /// Open (or create) the chain and serve the HTTP API
    Start {
        /// Directory containing node data (default: ~/.daochain)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Config file (default: <data-dir>/genesis.toml, else built-in defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// HTTP bind address (use 0.0.0.0 for public access)
        #[arg(long, default_value = "127.0.0.1:9000")]
        http_bind: String,

        /// Seconds between governance refreshes
        #[arg(long, default_value_t = 5)]
        tick_secs: u64,
    },

    /// Print the chain summary of a data directory
    Inspect {
        /// Directory containing node data (default: ~/.daochain)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Config file (default: <data-dir>/genesis.toml, else built-in defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Resolve an optional `--data-dir` to the default location
pub fn resolve_data_dir(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir.unwrap_or_else(Storage::default_data_dir)
}
