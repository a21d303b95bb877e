//! Content-addressed index over blocks and transactions

use std::collections::HashMap;

use super::block::Block;
use super::error::{LedgerError, LedgerResult};
use super::transaction::Transaction;
use super::types::{LookupKey, H256};

/// Anything the index can hold
#[derive(Clone, Debug)]
pub enum Record {
    Block(Block),
    Transaction(Transaction),
}

impl Record {
    pub fn digest(&self) -> H256 {
        match self {
            Record::Block(b) => b.hash,
            Record::Transaction(t) => t.hash,
        }
    }
}

/// Blocks by hash and by height (kept in lockstep), transactions by hash.
/// Block and transaction digests share one key space.
#[derive(Clone, Debug, Default)]
pub struct HashIndex {
    blocks: HashMap<H256, Block>,
    heights: HashMap<u64, H256>,
    transactions: HashMap<H256, Transaction>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, digest: &H256) -> bool {
        self.blocks.contains_key(digest) || self.transactions.contains_key(digest)
    }

    pub fn put(&mut self, record: Record) -> LedgerResult<()> {
        let digest = record.digest();
        if self.contains(&digest) {
            return Err(LedgerError::DuplicateKey(digest));
        }
        match record {
            Record::Block(block) => {
                if let Some(existing) = self.heights.get(&block.height) {
                    return Err(LedgerError::InvalidBlock(format!(
                        "height {} already indexed as {}",
                        block.height, existing
                    )));
                }
                self.heights.insert(block.height, digest);
                self.blocks.insert(digest, block);
                if self.heights.len() != self.blocks.len() {
                    // Unreachable while both inserts above happen together
                    return Err(LedgerError::InvalidBlock(format!(
                        "index out of lockstep: {} heights, {} blocks",
                        self.heights.len(),
                        self.blocks.len()
                    )));
                }
            }
            Record::Transaction(tx) => {
                self.transactions.insert(digest, tx);
            }
        }
        Ok(())
    }

    /// Index a block and all of its transactions, or nothing if any key collides.
    pub fn put_block(&mut self, block: &Block) -> LedgerResult<()> {
        self.check_block(block)?;
        for tx in &block.transactions {
            self.put(Record::Transaction(tx.clone()))?;
        }
        self.put(Record::Block(block.clone()))
    }

    /// Check that `block` and its transactions could all be inserted
    pub fn check_block(&self, block: &Block) -> LedgerResult<()> {
        if self.contains(&block.hash) {
            return Err(LedgerError::DuplicateKey(block.hash));
        }
        if let Some(existing) = self.heights.get(&block.height) {
            return Err(LedgerError::InvalidBlock(format!(
                "height {} already indexed as {}",
                block.height, existing
            )));
        }
        let mut seen = std::collections::HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            if tx.hash == block.hash || self.contains(&tx.hash) || !seen.insert(tx.hash) {
                return Err(LedgerError::DuplicateTransaction(tx.hash));
            }
        }
        Ok(())
    }

    pub fn get_block(&self, key: &LookupKey) -> LedgerResult<&Block> {
        let found = match key {
            LookupKey::ByHash(hash) => self.blocks.get(hash),
            LookupKey::ByHeight(height) => self.heights.get(height).and_then(|h| self.blocks.get(h)),
        };
        found.ok_or_else(|| match key {
            LookupKey::ByHash(hash) => LedgerError::NotFound(format!("block {}", hash)),
            LookupKey::ByHeight(height) => LedgerError::NotFound(format!("block at height {}", height)),
        })
    }

    pub fn get_transaction(&self, hash: &H256) -> LedgerResult<&Transaction> {
        self.transactions
            .get(hash)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", hash)))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }
}
