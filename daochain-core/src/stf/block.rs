//! Blocks: ordered, hash-linked batches of transactions

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{LedgerError, LedgerResult};
use super::transaction::Transaction;
use super::types::H256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: H256,
    /// `None` only at height 0
    pub parent_hash: Option<H256>,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block and stamp its hash onto it and its transactions
    pub fn seal(height: u64, parent_hash: Option<H256>, timestamp: u64, transactions: Vec<Transaction>) -> Self {
        let mut block = Self {
            height,
            hash: H256::ZERO,
            parent_hash,
            timestamp,
            transactions,
        };
        block.hash = block.compute_hash();
        for tx in &mut block.transactions {
            tx.block_hash = block.hash;
        }
        block
    }

    pub fn genesis(timestamp: u64, transactions: Vec<Transaction>) -> Self {
        Self::seal(0, None, timestamp, transactions)
    }

    /// Commitment to the ordered transaction hashes
    pub fn tx_root(&self) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(b"daochain-tx-root");
        hasher.update((self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(tx.hash.0);
        }
        hasher.into()
    }

    /// Digest of the canonical header: height, parent, timestamp, tx root
    pub fn compute_hash(&self) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(b"daochain-block");
        hasher.update(self.height.to_le_bytes());
        match self.parent_hash {
            Some(parent) => {
                hasher.update([1u8]);
                hasher.update(parent.0);
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.tx_root().0);
        hasher.into()
    }

    /// Self-consistency checks that need no chain context
    pub fn verify_integrity(&self) -> LedgerResult<()> {
        match (self.height, self.parent_hash) {
            (0, Some(_)) => {
                return Err(LedgerError::InvalidBlock("genesis block cannot have a parent".into()));
            }
            (h, None) if h > 0 => {
                return Err(LedgerError::InvalidBlock(format!("block {} has no parent hash", h)));
            }
            _ => {}
        }
        let expected = self.compute_hash();
        if self.hash != expected {
            return Err(LedgerError::InvalidBlock(format!(
                "block hash {} does not match contents ({})",
                self.hash, expected
            )));
        }
        for tx in &self.transactions {
            if tx.hash != tx.compute_hash() {
                return Err(LedgerError::InvalidBlock(format!(
                    "transaction hash {} does not match contents",
                    tx.hash
                )));
            }
            if tx.block_hash != self.hash {
                return Err(LedgerError::InvalidBlock(format!(
                    "transaction {} claims block {}, not {}",
                    tx.hash, tx.block_hash, self.hash
                )));
            }
        }
        Ok(())
    }
}
