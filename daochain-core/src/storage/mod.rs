//! Persistent storage for the chain
//!
//! Two files live in the data directory:
//! - `blocks.jsonl`: append-only block log, one JSON block per line, fsync'd
//!   on every append. This is the source of truth.
//! - `checkpoint.json`: periodic snapshot of ledger and governance state at
//!   some height, written atomically. Recovery replays the log past it.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::stf::{Block, GovernanceState, TokenLedger, H256};

/// Snapshot of derived state at `height`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    /// Hash of the block at `height`
    pub tip: H256,
    pub ledger: TokenLedger,
    pub governance: GovernanceState,
}

/// Storage manager for chain data
#[derive(Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Open (and create if needed) a data directory
    pub fn open(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("failed to create data directory {:?}", data_dir))?;
        }
        Ok(Self { data_dir })
    }

    /// Get the default data directory
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".daochain")
    }

    fn block_log_path(&self) -> PathBuf {
        self.data_dir.join("blocks.jsonl")
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.json")
    }

    // ─── Block log ─────────────────────────────────────────────────────

    /// Append a block to the log.
    /// The line is fsync'd to ensure it's on disk before returning. A failed
    /// write is truncated away so the log never holds a partial line.
    pub fn append_block(&self, block: &Block) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(block)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.block_log_path())?;
        drop_torn_tail(&mut file)?;
        append_line(&mut file, line.as_bytes())
    }

    /// Read every block in the log, in order.
    ///
    /// Reading stops at the first line that does not parse (a write torn by a
    /// crash). The log is then rewritten to the clean prefix so later appends
    /// land after a complete line.
    pub fn read_blocks(&self) -> anyhow::Result<Vec<Block>> {
        let path = self.block_log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).with_context(|| format!("failed to read {:?}", path))?;

        let mut blocks = Vec::new();
        let mut clean_len = 0usize;
        let mut needs_repair = false;
        for (line_num, line) in contents.split_inclusive('\n').enumerate() {
            let text = line.trim_end_matches('\n');
            if text.trim().is_empty() {
                clean_len += line.len();
                continue;
            }
            match serde_json::from_str::<Block>(text) {
                Ok(block) => {
                    blocks.push(block);
                    clean_len += line.len();
                    if !line.ends_with('\n') {
                        // Complete record, missing only its terminator
                        needs_repair = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Block log line {} unreadable, dropping it and everything after: {}",
                        line_num + 1,
                        e
                    );
                    needs_repair = true;
                    break;
                }
            }
        }

        if needs_repair {
            let mut clean = contents[..clean_len].to_string();
            if !clean.is_empty() && !clean.ends_with('\n') {
                clean.push('\n');
            }
            self.replace_file(&path, clean.as_bytes())?;
            tracing::warn!("🩹 Block log repaired: {} blocks kept", blocks.len());
        }

        Ok(blocks)
    }

    /// Overwrite the block log with exactly `blocks`
    pub fn rewrite_block_log(&self, blocks: &[Block]) -> anyhow::Result<()> {
        let mut contents = String::new();
        for block in blocks {
            contents.push_str(&serde_json::to_string(block)?);
            contents.push('\n');
        }
        self.replace_file(&self.block_log_path(), contents.as_bytes())
    }

    // ─── Checkpoint ────────────────────────────────────────────────────

    /// Load the checkpoint, if one exists and parses
    pub fn load_checkpoint(&self) -> Option<Checkpoint> {
        let path = self.checkpoint_path();
        if !path.exists() {
            tracing::info!("📂 No checkpoint found, replaying from genesis");
            return None;
        }
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(checkpoint) => {
                    tracing::info!("📂 Loaded checkpoint from {:?}", path);
                    Some(checkpoint)
                }
                Err(e) => {
                    tracing::warn!("Failed to parse checkpoint: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read checkpoint: {}", e);
                None
            }
        }
    }

    /// Save a checkpoint via write-to-temp-then-rename
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let path = self.checkpoint_path();
        let contents = serde_json::to_string_pretty(checkpoint)?;
        self.replace_file(&path, contents.as_bytes())?;
        tracing::debug!("💾 Checkpoint at height {} saved to {:?}", checkpoint.height, path);
        Ok(())
    }

    fn replace_file(&self, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path).with_context(|| format!("failed to replace {:?}", path))?;
        Ok(())
    }
}

/// Write one complete line at the end of `file`, or leave it as it was
fn append_line(file: &mut fs::File, line: &[u8]) -> anyhow::Result<()> {
    let start = file.metadata()?.len();
    let written = file.write_all(line).and_then(|_| file.sync_all());
    if let Err(e) = written {
        if let Err(trunc) = file.set_len(start) {
            tracing::error!("❌ Could not roll back partial block write: {}", trunc);
        }
        return Err(anyhow::Error::new(e).context("failed to append block"));
    }
    Ok(())
}

/// Cut bytes after the last newline, left behind by an append that never completed
fn drop_torn_tail(file: &mut fs::File) -> anyhow::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1) as u64;
    tracing::warn!("🩹 Dropping {} bytes of an unfinished block write", len - keep);
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(())
}
