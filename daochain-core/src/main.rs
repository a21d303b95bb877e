//! daochain - single-writer token ledger with DAO governance.
//!
//! Blocks of transfers, proposals, votes and treasury payouts are appended
//! to one chain; balances and proposal state are derived from it and served
//! over HTTP.

mod cli;
mod config;
mod query;
mod rpc;
mod stf;
mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{resolve_data_dir, Cli, Commands};
use crate::config::{NodeConfig, CONFIG_FILE_NAME};
use crate::rpc::{start_http_server, AppState};
use crate::stf::{ChainState, SystemClock};

fn load_config(config: Option<PathBuf>, data_dir: &Path) -> anyhow::Result<NodeConfig> {
    match config {
        Some(path) => NodeConfig::load(path),
        None => NodeConfig::load_or_default(data_dir),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { data_dir, force } => {
            let data_dir = resolve_data_dir(data_dir);
            tracing::info!("Initializing daochain at {:?}", data_dir);
            std::fs::create_dir_all(&data_dir)?;

            let config_path = data_dir.join(CONFIG_FILE_NAME);
            if config_path.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", config_path);
            }
            std::fs::write(&config_path, NodeConfig::default().to_toml_string()?)?;

            tracing::info!("Node initialized. Config written to {:?}", config_path);
        }

        Commands::Start {
            data_dir,
            config,
            http_bind,
            tick_secs,
        } => {
            tracing::info!("🦀 Starting daochain...");
            let data_dir = resolve_data_dir(data_dir);
            let config = load_config(config, &data_dir)?;
            let http_addr: std::net::SocketAddr = http_bind
                .parse()
                .with_context(|| format!("invalid HTTP bind address {:?} (use format: 127.0.0.1:9000)", http_bind))?;

            let chain = ChainState::open(&data_dir, &config, Arc::new(SystemClock))?;
            let app_state = Arc::new(AppState::new(chain.clone(), config.chain.default_sender.clone()));

            // Proposal statuses are evaluated lazily on every read; the ticker
            // only keeps the stored statuses fresh for checkpoints.
            let chain_for_ticks = chain.clone();
            let ticker = tokio::spawn(async move {
                let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(tick_secs.max(1)));
                loop {
                    interval.tick().await;
                    let chain = chain_for_ticks.clone();
                    match tokio::task::spawn_blocking(move || chain.tick_governance()).await {
                        Ok(Ok(closed)) if closed > 0 => {
                            tracing::debug!("🏛️ Governance tick closed {} proposals", closed);
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!("⚠️ Governance tick failed: {}", e),
                        Err(e) => tracing::error!("💥 Governance tick task failed: {}", e),
                    }
                }
            });

            tracing::info!("✅ Node running - HTTP: {}, height {}", http_addr, chain.height());

            start_http_server(app_state, http_addr, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                }
                tracing::info!("Shutting down...");
            })
            .await?;

            ticker.abort();
            chain.save_checkpoint()?;
            tracing::info!("💾 Final checkpoint written at height {}", chain.height());
        }

        Commands::Inspect { data_dir, config } => {
            let data_dir = resolve_data_dir(data_dir);
            if !data_dir.join("blocks.jsonl").exists() {
                anyhow::bail!("no chain found in {:?}", data_dir);
            }
            let config = load_config(config, &data_dir)?;
            let chain = ChainState::open(&data_dir, &config, Arc::new(SystemClock))?;
            println!("{}", serde_json::to_string_pretty(&chain.status())?);
        }
    }

    Ok(())
}
