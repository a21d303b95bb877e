//! Chain Store
//!
//! Owns the block sequence and everything derived from it. Blocks are
//! validated against copies of the ledger and governance state; the copies
//! replace the live state only after the whole block applied cleanly and the
//! block reached the log, so a rejected block changes nothing.
//!
//! Proposal statuses are settled as part of block application: before a
//! block's transactions, every proposal whose deadline the block timestamp
//! has reached is closed against the pre-block state; after them, decisive
//! early closes are recorded. Replaying the log reproduces every status.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use super::block::Block;
use super::error::{LedgerError, LedgerResult};
use super::governance::{
    normalize_proposal_id, Delegation, ElectorateSource, GovernanceState, Proposal, ProposalDraft, VoteChoice,
    VotingPower,
};
use super::index::HashIndex;
use super::ledger::TokenLedger;
use super::transaction::{Transaction, TxPayload, TxReceipt};
use super::types::{validate_address, Clock, LookupKey, GENESIS_ADDRESS, H256, TREASURY_ADDRESS};
use crate::config::NodeConfig;
use crate::storage::{Checkpoint, Storage};

/// Global tainted flag, set when a poisoned lock is recovered.
/// Once tainted, commits are refused until the node restarts.
static STATE_TAINTED: AtomicBool = AtomicBool::new(false);

pub fn is_state_tainted() -> bool {
    STATE_TAINTED.load(Ordering::SeqCst)
}

/// Recovers from poisoned RwLocks but marks the state as tainted.
trait PoisonRecover<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> PoisonRecover<T> for RwLock<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 RwLock was poisoned (read), state is TAINTED, node should be restarted");
            STATE_TAINTED.store(true, Ordering::SeqCst);
            poisoned.into_inner()
        })
    }
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 RwLock was poisoned (write), state is TAINTED, node should be restarted");
            STATE_TAINTED.store(true, Ordering::SeqCst);
            poisoned.into_inner()
        })
    }
}

/// The most recently appended block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ChainTip {
    pub height: u64,
    pub hash: H256,
    pub timestamp: u64,
}

/// Summary of the chain for status queries
#[derive(Clone, Debug, Serialize)]
pub struct ChainStatus {
    pub height: u64,
    pub tip: H256,
    pub tip_timestamp: u64,
    pub total_supply: u64,
    pub treasury_balance: u64,
    pub blocks: usize,
    pub transactions: usize,
    pub proposals: usize,
    pub holders: usize,
    pub tainted: bool,
}

struct StateInner {
    index: HashIndex,
    ledger: TokenLedger,
    governance: GovernanceState,
    tip: Option<ChainTip>,
}

/// Thread-safe handle to the chain. Clones share state.
#[derive(Clone)]
pub struct ChainState {
    inner: Arc<RwLock<StateInner>>,
    /// Serializes every writer; readers only take `inner`
    commit_gate: Arc<Mutex<()>>,
    storage: Option<Arc<Storage>>,
    clock: Arc<dyn Clock>,
    checkpoint_interval: u64,
}

impl ChainState {
    fn empty(config: &NodeConfig, storage: Option<Arc<Storage>>, clock: Arc<dyn Clock>) -> Self {
        let inner = StateInner {
            index: HashIndex::new(),
            ledger: TokenLedger::new(),
            governance: GovernanceState::with_params(config.governance.clone()),
            tip: None,
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
            commit_gate: Arc::new(Mutex::new(())),
            storage,
            clock,
            checkpoint_interval: config.chain.checkpoint_interval,
        }
    }

    /// A chain with no persistence, started from the configured genesis
    pub fn in_memory(config: &NodeConfig, clock: Arc<dyn Clock>) -> LedgerResult<Self> {
        let state = Self::empty(config, None, clock);
        state.append_block(config.genesis_block())?;
        Ok(state)
    }

    /// Open the chain stored in `data_dir`, recovering from its block log and
    /// checkpoint, or write a fresh genesis block if the log is empty.
    pub fn open(data_dir: impl AsRef<Path>, config: &NodeConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let storage = Arc::new(Storage::open(data_dir.as_ref())?);
        let state = Self::empty(config, Some(storage.clone()), clock);

        let blocks = storage.read_blocks()?;
        if blocks.is_empty() {
            let genesis = config.genesis_block();
            tracing::info!("🌱 Fresh chain, genesis {}", genesis.hash.short());
            state.append_block(genesis)?;
            return Ok(state);
        }

        let expected_genesis = config.genesis_block().hash;
        if blocks[0].hash != expected_genesis {
            tracing::warn!(
                "⚠️ Block log genesis {} differs from configured genesis {}; the log wins",
                blocks[0].hash.short(),
                expected_genesis.short()
            );
        }

        let start = match storage.load_checkpoint() {
            Some(checkpoint) => match state.restore_checkpoint(checkpoint, &blocks, config) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!("⚠️ Checkpoint unusable ({}), replaying from genesis", e);
                    state.reset(config);
                    0
                }
            },
            None => 0,
        };

        let gate = state.lock_gate();
        for (offset, block) in blocks[start..].iter().enumerate() {
            if let Err(e) = state.commit_locked(block.clone(), false) {
                let keep = start + offset;
                tracing::warn!(
                    "⚠️ Block #{} in log failed replay ({}), truncating log to {} blocks",
                    block.height,
                    e,
                    keep
                );
                storage.rewrite_block_log(&blocks[..keep])?;
                break;
            }
        }
        drop(gate);

        let status = state.status();
        tracing::info!(
            "📊 Recovered chain: height {}, tip {}, {} transactions, {} proposals",
            status.height,
            status.tip.short(),
            status.transactions,
            status.proposals
        );
        if status.blocks == 0 {
            anyhow::bail!("block log holds no valid genesis block");
        }
        Ok(state)
    }

    /// Index blocks up to the checkpoint height and install its state.
    /// Returns the position of the first block still to replay.
    fn restore_checkpoint(&self, checkpoint: Checkpoint, blocks: &[Block], config: &NodeConfig) -> LedgerResult<usize> {
        let height = checkpoint.height as usize;
        match blocks.get(height) {
            Some(block) if block.hash == checkpoint.tip => {}
            _ => {
                return Err(LedgerError::InvalidBlock(format!(
                    "checkpoint at height {} ({}) not found in block log",
                    checkpoint.height, checkpoint.tip
                )));
            }
        }

        let mut inner = self.inner.write_or_recover();
        let mut parent: Option<H256> = None;
        for (position, block) in blocks[..=height].iter().enumerate() {
            block.verify_integrity()?;
            if block.height != position as u64 || block.parent_hash != parent {
                return Err(LedgerError::InvalidBlock(format!(
                    "block log broken at position {}",
                    position
                )));
            }
            inner.index.put_block(block)?;
            parent = Some(block.hash);
        }

        let mut governance = checkpoint.governance;
        governance.params = config.governance.clone();
        inner.ledger = checkpoint.ledger;
        inner.governance = governance;
        inner.tip = Some(ChainTip {
            height: blocks[height].height,
            hash: blocks[height].hash,
            timestamp: blocks[height].timestamp,
        });
        tracing::info!("📂 Checkpoint restored at height {}", checkpoint.height);
        Ok(height + 1)
    }

    fn reset(&self, config: &NodeConfig) {
        let mut inner = self.inner.write_or_recover();
        inner.index = HashIndex::new();
        inner.ledger = TokenLedger::new();
        inner.governance = GovernanceState::with_params(config.governance.clone());
        inner.tip = None;
    }

    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        self.commit_gate.lock().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 Commit gate was poisoned, state is TAINTED, node should be restarted");
            STATE_TAINTED.store(true, Ordering::SeqCst);
            poisoned.into_inner()
        })
    }

    // ============ WRITES ============

    /// Append a finalized block produced elsewhere.
    /// All-or-nothing: on error, no state has changed.
    pub fn append_block(&self, block: Block) -> LedgerResult<()> {
        let _gate = self.lock_gate();
        self.commit_locked(block, true)
    }

    /// Validate and commit `block`. Caller holds the commit gate.
    fn commit_locked(&self, block: Block, persist: bool) -> LedgerResult<()> {
        if is_state_tainted() {
            tracing::error!("🚨 Refusing block: state is tainted (poisoned lock detected). Restart the node.");
            return Err(LedgerError::Storage("node state is tainted, restart required".into()));
        }

        let result = self.validate_block(&block);
        let (ledger, governance) = match result {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("❌ Block #{} ({}) rejected: {}", block.height, block.hash.short(), e);
                return Err(e);
            }
        };

        if persist {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.append_block(&block) {
                    tracing::error!("💥 Block #{} not written to log: {:#}", block.height, e);
                    return Err(LedgerError::Storage(e.to_string()));
                }
            }
        }

        {
            let mut inner = self.inner.write_or_recover();
            inner.index.put_block(&block)?;
            inner.ledger = ledger;
            inner.governance = governance;
            inner.tip = Some(ChainTip {
                height: block.height,
                hash: block.hash,
                timestamp: block.timestamp,
            });
        }

        if persist {
            tracing::info!(
                "⛓️ Block #{} committed ({} txs, {})",
                block.height,
                block.transactions.len(),
                block.hash.short()
            );
            if self.checkpoint_interval > 0 && block.height % self.checkpoint_interval == 0 {
                if let Err(e) = self.save_checkpoint() {
                    tracing::warn!("⚠️ Checkpoint at height {} failed: {:#}", block.height, e);
                }
            }
        } else {
            tracing::debug!("🔁 Replayed block #{}", block.height);
        }
        Ok(())
    }

    /// Run every check and every transaction of `block` against copies of the
    /// current state. Returns the resulting ledger and governance state.
    fn validate_block(&self, block: &Block) -> LedgerResult<(TokenLedger, GovernanceState)> {
        block.verify_integrity()?;

        let (mut ledger, mut governance) = {
            let inner = self.inner.read_or_recover();
            let expected_height = inner.tip.map_or(0, |t| t.height + 1);
            let expected_parent = inner.tip.map(|t| t.hash);
            if block.height != expected_height || block.parent_hash != expected_parent {
                return Err(LedgerError::ChainForkRejected {
                    expected_height,
                    expected_parent,
                    height: block.height,
                    parent: block.parent_hash,
                });
            }
            if let Some(tip) = inner.tip {
                if block.timestamp < tip.timestamp {
                    return Err(LedgerError::InvalidBlock(format!(
                        "block timestamp {} precedes parent timestamp {}",
                        block.timestamp, tip.timestamp
                    )));
                }
            }
            inner.index.check_block(block)?;
            (inner.ledger.clone(), inner.governance.clone())
        };

        settle_proposals(&ledger, &mut governance, block.timestamp);
        for tx in &block.transactions {
            apply_tx(&mut ledger, &mut governance, tx, block)?;
        }
        settle_proposals(&ledger, &mut governance, block.timestamp);
        Ok((ledger, governance))
    }

    /// Wrap `payload` into a transaction from `from`, seal it into a
    /// one-transaction block on the tip, and commit it.
    fn submit(&self, from: &str, payload: TxPayload) -> LedgerResult<TxReceipt> {
        validate_address(from)?;
        let _gate = self.lock_gate();

        let (tip, nonce) = {
            let inner = self.inner.read_or_recover();
            let tip = inner
                .tip
                .ok_or_else(|| LedgerError::InvalidBlock("chain has no genesis block".into()))?;
            (tip, inner.ledger.nonce_of(from))
        };

        // Block timestamps never run backwards, even if the clock does
        let timestamp = self.clock.now().max(tip.timestamp);
        let tx = Transaction::new(from, nonce, timestamp, payload);
        let block = Block::seal(tip.height + 1, Some(tip.hash), timestamp, vec![tx]);
        let tx = &block.transactions[0];
        let receipt = TxReceipt {
            tx_hash: tx.hash,
            block_hash: block.hash,
            block_height: block.height,
            kind: tx.kind().as_str().to_string(),
        };

        self.commit_locked(block, true)?;
        Ok(receipt)
    }

    pub fn submit_transfer(&self, from: &str, to: &str, amount: u64) -> LedgerResult<TxReceipt> {
        self.submit(
            from,
            TxPayload::Transfer {
                to: to.to_string(),
                amount,
            },
        )
    }

    /// Create a proposal. Its id is the receipt's transaction hash in hex.
    pub fn submit_proposal(&self, creator: &str, draft: ProposalDraft) -> LedgerResult<TxReceipt> {
        self.submit(creator, TxPayload::ProposalCreate(draft))
    }

    pub fn submit_vote(&self, voter: &str, proposal_id: &str, choice: VoteChoice) -> LedgerResult<TxReceipt> {
        self.submit(
            voter,
            TxPayload::Vote {
                proposal_id: proposal_id.to_string(),
                choice,
            },
        )
    }

    /// Pay out a passed treasury proposal; `executor` may be any account
    pub fn submit_treasury_transfer(
        &self,
        executor: &str,
        proposal_id: &str,
        to: &str,
        amount: u64,
    ) -> LedgerResult<TxReceipt> {
        self.submit(
            executor,
            TxPayload::TreasuryTransfer {
                proposal_id: proposal_id.to_string(),
                to: to.to_string(),
                amount,
            },
        )
    }

    /// Lend `delegator`'s voting power to `delegate` for `duration` seconds
    pub fn submit_delegation(&self, delegator: &str, delegate: &str, duration: u64) -> LedgerResult<TxReceipt> {
        self.submit(
            delegator,
            TxPayload::Delegate {
                delegate: delegate.to_string(),
                duration,
            },
        )
    }

    pub fn submit_revoke_delegation(&self, delegator: &str) -> LedgerResult<TxReceipt> {
        self.submit(delegator, TxPayload::RevokeDelegation)
    }

    /// Close proposals that are due by committing an empty block at the
    /// current time. Returns how many closed; no block is written when none
    /// are due.
    pub fn tick_governance(&self) -> LedgerResult<usize> {
        let _gate = self.lock_gate();
        let (tip, now, due) = {
            let inner = self.inner.read_or_recover();
            let tip = inner
                .tip
                .ok_or_else(|| LedgerError::InvalidBlock("chain has no genesis block".into()))?;
            let now = self.clock.now().max(tip.timestamp);
            let power = VotingPower::new(&inner.ledger, &inner.governance.delegations);
            (tip, now, inner.governance.pending_changes(now, &power))
        };
        if due == 0 {
            return Ok(0);
        }

        let block = Block::seal(tip.height + 1, Some(tip.hash), now, Vec::new());
        self.commit_locked(block, true)?;
        tracing::info!("🏛️ {} proposal(s) closed at height {}", due, tip.height + 1);
        Ok(due)
    }

    /// Write a checkpoint of the current state. No-op without storage.
    pub fn save_checkpoint(&self) -> anyhow::Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let checkpoint = {
            let inner = self.inner.read_or_recover();
            let Some(tip) = inner.tip else {
                return Ok(());
            };
            Checkpoint {
                height: tip.height,
                tip: tip.hash,
                ledger: inner.ledger.clone(),
                governance: inner.governance.clone(),
            }
        };
        storage.save_checkpoint(&checkpoint)
    }

    // ============ READS ============

    pub fn get_block(&self, key: &LookupKey) -> LedgerResult<Block> {
        self.inner.read_or_recover().index.get_block(key).cloned()
    }

    pub fn get_transaction(&self, hash: &H256) -> LedgerResult<Transaction> {
        self.inner.read_or_recover().index.get_transaction(hash).cloned()
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.inner.read_or_recover().ledger.balance_of(address)
    }

    pub fn nonce_of(&self, address: &str) -> u64 {
        self.inner.read_or_recover().ledger.nonce_of(address)
    }

    pub fn treasury_balance(&self) -> u64 {
        self.inner.read_or_recover().ledger.treasury_balance()
    }

    pub fn total_supply(&self) -> u64 {
        self.inner.read_or_recover().ledger.total_supply()
    }

    pub fn tip(&self) -> Option<ChainTip> {
        self.inner.read_or_recover().tip
    }

    pub fn height(&self) -> u64 {
        self.tip().map_or(0, |t| t.height)
    }

    /// All proposals in creation order, statuses evaluated now
    pub fn list_proposals(&self) -> Vec<Proposal> {
        let now = self.clock.now();
        let inner = self.inner.read_or_recover();
        let power = VotingPower::new(&inner.ledger, &inner.governance.delegations);
        inner.governance.evaluated_proposals(now, &power)
    }

    pub fn get_proposal(&self, id: &str) -> LedgerResult<Proposal> {
        let now = self.clock.now();
        let inner = self.inner.read_or_recover();
        let power = VotingPower::new(&inner.ledger, &inner.governance.delegations);
        inner.governance.evaluated_proposal(id, now, &power)
    }

    /// Latest delegation made by `delegator`, active or not
    pub fn get_delegation(&self, delegator: &str) -> LedgerResult<Delegation> {
        self.inner
            .read_or_recover()
            .governance
            .delegations
            .get(delegator)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("delegation from {}", delegator)))
    }

    /// Delegations in force now, ordered by delegator
    pub fn active_delegations(&self) -> Vec<Delegation> {
        let now = self.clock.now();
        let inner = self.inner.read_or_recover();
        inner.governance.delegations.active(now).cloned().collect()
    }

    /// (own, delegated) voting balance of `address` now
    pub fn voting_power(&self, address: &str) -> (u64, u64) {
        let now = self.clock.now();
        let inner = self.inner.read_or_recover();
        let power = VotingPower::new(&inner.ledger, &inner.governance.delegations);
        (power.own(address, now), power.delegated(address, now))
    }

    #[cfg(test)]
    pub fn tally(&self, id: &str) -> LedgerResult<super::governance::Tally> {
        let inner = self.inner.read_or_recover();
        inner
            .governance
            .get_proposal(id)
            .map(Proposal::tally)
            .ok_or_else(|| LedgerError::NotFound(format!("proposal {}", id)))
    }

    pub fn funded_proposals(&self) -> usize {
        self.inner.read_or_recover().governance.funded_count()
    }

    pub fn status(&self) -> ChainStatus {
        let inner = self.inner.read_or_recover();
        let tip = inner.tip;
        ChainStatus {
            height: tip.map_or(0, |t| t.height),
            tip: tip.map_or(H256::ZERO, |t| t.hash),
            tip_timestamp: tip.map_or(0, |t| t.timestamp),
            total_supply: inner.ledger.total_supply(),
            treasury_balance: inner.ledger.treasury_balance(),
            blocks: inner.index.block_count(),
            transactions: inner.index.transaction_count(),
            proposals: inner.governance.proposals.len(),
            holders: inner.ledger.holder_count(),
            tainted: is_state_tainted(),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    #[cfg(test)]
    fn ledger_snapshot(&self) -> TokenLedger {
        self.inner.read_or_recover().ledger.clone()
    }
}

/// Record every proposal status that is settled at `now`
fn settle_proposals(ledger: &TokenLedger, governance: &mut GovernanceState, now: u64) {
    let delegations = governance.delegations.clone();
    let power = VotingPower::new(ledger, &delegations);
    for (id, status) in governance.tick(now, &power) {
        tracing::debug!("🏛️ Proposal {} settled: {:?}", &id[..8.min(id.len())], status);
    }
}

/// Apply one transaction of `block` to working copies of the state
fn apply_tx(ledger: &mut TokenLedger, governance: &mut GovernanceState, tx: &Transaction, block: &Block) -> LedgerResult<()> {
    let now = block.timestamp;
    ledger.consume_nonce(&tx.from, tx.nonce)?;

    match &tx.payload {
        TxPayload::Mint { to, amount } => {
            if block.height != 0 {
                return Err(LedgerError::InvalidBlock(format!(
                    "mint {} outside the genesis block",
                    tx.hash
                )));
            }
            if tx.from != GENESIS_ADDRESS {
                return Err(LedgerError::Unauthorized(format!("{} cannot mint", tx.from)));
            }
            validate_address(to)?;
            ledger.mint(to, *amount)?;
        }
        _ if block.height == 0 => {
            return Err(LedgerError::InvalidBlock(format!(
                "genesis block may only mint, found {}",
                tx.kind().as_str()
            )));
        }
        _ if tx.from == GENESIS_ADDRESS || tx.from == TREASURY_ADDRESS => {
            return Err(LedgerError::Unauthorized(format!(
                "reserved account {} cannot send {}",
                tx.from,
                tx.kind().as_str()
            )));
        }
        TxPayload::Transfer { to, amount } => {
            validate_address(&tx.from)?;
            validate_address(to)?;
            ledger.apply_transfer(&tx.from, to, *amount)?;
        }
        TxPayload::ProposalCreate(draft) => {
            validate_address(&tx.from)?;
            let balance = ledger.balance_of(&tx.from);
            governance.create_proposal(tx.hash.to_hex(), &tx.from, draft.clone(), balance, now, block.height)?;
        }
        TxPayload::Vote { proposal_id, choice } => {
            let proposal_id = normalize_proposal_id(proposal_id)?;
            let (basis, electorate) = {
                let power = VotingPower::new(ledger, &governance.delegations);
                let proposal = governance
                    .get_proposal(&proposal_id)
                    .ok_or_else(|| LedgerError::NotFound(format!("proposal {}", proposal_id)))?;
                (power.vote_balance(&tx.from, now, proposal), power.electorate_at(now))
            };
            governance.cast_vote(&proposal_id, &tx.from, *choice, basis, now, &electorate, tx.hash)?;
        }
        TxPayload::TreasuryTransfer {
            proposal_id,
            to,
            amount,
        } => {
            let proposal_id = normalize_proposal_id(proposal_id)?;
            validate_address(to)?;
            let delegations = governance.delegations.clone();
            let power = VotingPower::new(ledger, &delegations);
            governance.authorize_treasury_debit(&proposal_id, to, *amount, now, &power, tx.hash)?;
            let proposal = governance
                .get_proposal(&proposal_id)
                .ok_or_else(|| LedgerError::NotFound(format!("proposal {}", proposal_id)))?;
            ledger.apply_treasury_transfer(to, *amount, proposal)?;
            tracing::debug!("🏦 Treasury paid {} to {} for {}", amount, to, &proposal_id[..8]);
        }
        TxPayload::Delegate { delegate, duration } => {
            validate_address(delegate)?;
            let balance = ledger.balance_of(&tx.from);
            let known = ledger.is_known(delegate);
            governance.delegate(&tx.from, delegate, *duration, balance, known, now, tx.hash)?;
        }
        TxPayload::RevokeDelegation => {
            governance.revoke_delegation(&tx.from, now)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Allocation, ChainConfig, TreasuryConfig};
    use crate::stf::governance::{Funding, GovernanceParams, ProposalStatus, ProposalType, VotingType};
    use crate::stf::types::ManualClock;

    const T0: u64 = 1_700_000_000;

    fn config() -> NodeConfig {
        let alloc = |address: &str, amount| Allocation {
            address: address.to_string(),
            amount,
        };
        NodeConfig {
            chain: ChainConfig {
                genesis_timestamp: T0,
                checkpoint_interval: 2,
                default_sender: None,
            },
            governance: GovernanceParams::default(),
            treasury: TreasuryConfig { initial_balance: 5_000 },
            allocations: vec![alloc("alice", 1_000), alloc("bob", 1_000), alloc("carol", 8_000)],
        }
    }

    fn chain() -> (ChainState, Arc<ManualClock>) {
        let clock = ManualClock::at(T0 + 10);
        let state = ChainState::in_memory(&config(), clock.clone()).unwrap();
        (state, clock)
    }

    fn draft(proposal_type: ProposalType, funding: Option<Funding>) -> ProposalDraft {
        ProposalDraft {
            title: "Fund the indexer".to_string(),
            description: "Pay for six months of hosting".to_string(),
            proposal_type,
            voting_type: VotingType::Weighted,
            duration: 3_600,
            threshold: 50,
            funding,
        }
    }

    fn transfer_block(state: &ChainState, from: &str, to: &str, amount: u64) -> Block {
        let tip = state.tip().unwrap();
        let tx = Transaction::new(
            from,
            state.nonce_of(from),
            tip.timestamp,
            TxPayload::Transfer {
                to: to.to_string(),
                amount,
            },
        );
        Block::seal(tip.height + 1, Some(tip.hash), tip.timestamp, vec![tx])
    }

    #[test]
    fn test_genesis_lookup_by_height() {
        let (state, _) = chain();
        let genesis = state.get_block(&"0".parse().unwrap()).unwrap();
        assert_eq!(genesis.height, 0);
        assert!(genesis.parent_hash.is_none());
        assert_eq!(state.total_supply(), 15_000);
        assert_eq!(state.treasury_balance(), 5_000);
        assert_eq!(state.balance_of("carol"), 8_000);

        assert!(matches!(
            state.get_block(&LookupKey::ByHeight(9_999_999)),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_heights_are_gapless_and_linked() {
        let (state, _) = chain();
        for i in 0..5u64 {
            let block = transfer_block(&state, "alice", "dave", 10 + i);
            state.append_block(block.clone()).unwrap();
            let tip = state.tip().unwrap();
            assert_eq!(tip.height, i + 1);
            assert_eq!(tip.hash, block.hash);
        }
        for height in 1..=5u64 {
            let block = state.get_block(&LookupKey::ByHeight(height)).unwrap();
            let parent = state.get_block(&LookupKey::ByHeight(height - 1)).unwrap();
            assert_eq!(block.parent_hash, Some(parent.hash));
        }
    }

    #[test]
    fn test_fork_rejected_and_state_untouched() {
        let (state, _) = chain();
        let block = transfer_block(&state, "alice", "bob", 1);
        state.append_block(block.clone()).unwrap();

        // Same height again, and a block on a stale parent
        let stale = Block::seal(1, block.parent_hash, block.timestamp, vec![]);
        let err = state.append_block(stale).unwrap_err();
        assert!(matches!(err, LedgerError::ChainForkRejected { expected_height: 2, .. }));
        assert!(err.is_retryable());

        let skip = Block::seal(5, Some(block.hash), block.timestamp, vec![]);
        assert!(matches!(
            state.append_block(skip),
            Err(LedgerError::ChainForkRejected { .. })
        ));
        assert_eq!(state.height(), 1);
    }

    #[test]
    fn test_block_is_all_or_nothing() {
        let (state, _) = chain();
        let tip = state.tip().unwrap();
        let good = Transaction::new(
            "alice",
            0,
            tip.timestamp,
            TxPayload::Transfer {
                to: "dave".to_string(),
                amount: 500,
            },
        );
        let overdraw = Transaction::new(
            "bob",
            0,
            tip.timestamp,
            TxPayload::Transfer {
                to: "dave".to_string(),
                amount: 1_001,
            },
        );
        let block = Block::seal(1, Some(tip.hash), tip.timestamp, vec![good.clone(), overdraw]);

        let err = state.append_block(block).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(state.balance_of("alice"), 1_000);
        assert_eq!(state.balance_of("dave"), 0);
        assert_eq!(state.nonce_of("alice"), 0);
        assert_eq!(state.height(), 0);
        assert!(state.get_transaction(&good.hash).is_err());
    }

    #[test]
    fn test_duplicate_transaction_rejected() {
        let (state, _) = chain();
        let block = transfer_block(&state, "alice", "bob", 5);
        let tx = block.transactions[0].clone();
        state.append_block(block.clone()).unwrap();

        let replay = Block::seal(2, Some(block.hash), block.timestamp, vec![tx.clone()]);
        assert_eq!(
            state.append_block(replay),
            Err(LedgerError::DuplicateTransaction(tx.hash))
        );
    }

    #[test]
    fn test_stale_nonce_rejected() {
        let (state, _) = chain();
        state.submit_transfer("alice", "bob", 1).unwrap();
        let tip = state.tip().unwrap();
        let tx = Transaction::new(
            "alice",
            0,
            tip.timestamp + 1,
            TxPayload::Transfer {
                to: "bob".to_string(),
                amount: 1,
            },
        );
        let block = Block::seal(tip.height + 1, Some(tip.hash), tip.timestamp, vec![tx]);
        assert!(matches!(
            state.append_block(block),
            Err(LedgerError::InvalidNonce { expected: 1, got: 0, .. })
        ));
    }

    #[test]
    fn test_mint_outside_genesis_rejected() {
        let (state, _) = chain();
        let tip = state.tip().unwrap();
        let tx = Transaction::new(
            GENESIS_ADDRESS,
            state.nonce_of(GENESIS_ADDRESS),
            tip.timestamp,
            TxPayload::Mint {
                to: "mallory".to_string(),
                amount: 1_000_000,
            },
        );
        let block = Block::seal(1, Some(tip.hash), tip.timestamp, vec![tx]);
        assert!(matches!(state.append_block(block), Err(LedgerError::InvalidBlock(_))));
        assert_eq!(state.total_supply(), 15_000);
    }

    #[test]
    fn test_transfers_conserve_supply() {
        let (state, _) = chain();
        let supply = state.total_supply();
        let moves = [("alice", "bob", 400), ("bob", "dave", 900), ("carol", "alice", 3_000), ("dave", "erin", 1)];
        for (from, to, amount) in moves {
            let (from_before, to_before) = (state.balance_of(from), state.balance_of(to));
            let receipt = state.submit_transfer(from, to, amount).unwrap();
            assert_eq!(receipt.kind, "transfer");
            assert_eq!(state.balance_of(from) + amount, from_before);
            assert_eq!(state.balance_of(to), to_before + amount);
        }
        let sum: u64 = ["alice", "bob", "carol", "dave", "erin", TREASURY_ADDRESS]
            .iter()
            .map(|a| state.balance_of(a))
            .sum();
        assert_eq!(sum, supply);
        assert_eq!(state.total_supply(), supply);
    }

    #[test]
    fn test_overdraw_leaves_balances_unchanged() {
        let (state, _) = chain();
        let height = state.height();
        let err = state.submit_transfer("bob", "alice", 1_001).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(state.balance_of("bob"), 1_000);
        assert_eq!(state.balance_of("alice"), 1_000);
        assert_eq!(state.height(), height);

        assert!(matches!(
            state.submit_transfer("bob", "alice", 0),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            state.submit_transfer("bob", "bad address!", 1),
            Err(LedgerError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_unknown_address_has_zero_balance() {
        let (state, _) = chain();
        assert_eq!(state.balance_of("nobody"), 0);
    }

    #[test]
    fn test_duplicate_vote_keeps_tally() {
        let (state, _) = chain();
        let receipt = state
            .submit_proposal("alice", draft(ProposalType::General, None))
            .unwrap();
        let id = receipt.tx_hash.to_hex();

        state.submit_vote("bob", &id, VoteChoice::Yes).unwrap();
        let before = state.tally(&id).unwrap();
        let err = state.submit_vote("bob", &id, VoteChoice::No).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVote { .. }));
        assert_eq!(state.tally(&id).unwrap(), before);
        assert_eq!(before.yes, 1_000);
    }

    #[test]
    fn test_tie_rejected_after_deadline() {
        let (state, clock) = chain();
        let id = state
            .submit_proposal("alice", draft(ProposalType::General, None))
            .unwrap()
            .tx_hash
            .to_hex();
        state.submit_vote("alice", &id, VoteChoice::Yes).unwrap();
        state.submit_vote("bob", &id, VoteChoice::No).unwrap();
        assert_eq!(state.get_proposal(&id).unwrap().status, ProposalStatus::Open);

        clock.advance(3_600);
        assert_eq!(state.get_proposal(&id).unwrap().status, ProposalStatus::Rejected);
        assert_eq!(state.list_proposals()[0].status, ProposalStatus::Rejected);

        assert!(matches!(
            state.submit_vote("carol", &id, VoteChoice::Yes),
            Err(LedgerError::ProposalClosed(_))
        ));
        assert_eq!(state.tick_governance().unwrap(), 1);
        assert_eq!(state.tick_governance().unwrap(), 0);
    }

    #[test]
    fn test_tick_commits_empty_closing_block() {
        let (state, clock) = chain();
        let id = state
            .submit_proposal("alice", draft(ProposalType::General, None))
            .unwrap()
            .tx_hash
            .to_hex();
        assert_eq!(state.tick_governance().unwrap(), 0);
        assert_eq!(state.height(), 1);

        clock.advance(3_600);
        assert_eq!(state.tick_governance().unwrap(), 1);
        let tip = state.tip().unwrap();
        assert_eq!(tip.height, 2);
        assert_eq!(tip.timestamp, clock.now());
        assert!(state.get_block(&LookupKey::ByHeight(2)).unwrap().transactions.is_empty());
        assert_eq!(state.get_proposal(&id).unwrap().status, ProposalStatus::Expired);

        assert_eq!(state.tick_governance().unwrap(), 0);
        assert_eq!(state.height(), 2);
    }

    #[test]
    fn test_passed_status_survives_electorate_change() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0 + 10);
        let mut cfg = config();
        cfg.governance.quorum_percent = 10;

        let (general, grant) = {
            let state = ChainState::open(dir.path(), &cfg, clock.clone()).unwrap();
            let general = state
                .submit_proposal("bob", draft(ProposalType::General, None))
                .unwrap()
                .tx_hash
                .to_hex();
            let funding = Funding {
                recipient: "dave".to_string(),
                amount: 2_000,
            };
            let grant = state
                .submit_proposal("bob", draft(ProposalType::Treasury, Some(funding)))
                .unwrap()
                .tx_hash
                .to_hex();
            // 1_000 of 10_000 meets the 10% quorum at the deadline
            state.submit_vote("alice", &general, VoteChoice::Yes).unwrap();
            state.submit_vote("carol", &grant, VoteChoice::Yes).unwrap();

            clock.advance(3_600);
            assert_eq!(state.get_proposal(&general).unwrap().status, ProposalStatus::Passed);

            // The payout grows the electorate to 12_000, where 1_000 would miss quorum
            state.submit_treasury_transfer("alice", &grant, "dave", 2_000).unwrap();
            assert_eq!(state.get_proposal(&general).unwrap().status, ProposalStatus::Passed);
            assert_eq!(state.list_proposals()[0].status, ProposalStatus::Passed);
            (general, grant)
        };

        std::fs::remove_file(dir.path().join("checkpoint.json")).ok();
        let replayed = ChainState::open(dir.path(), &cfg, clock).unwrap();
        assert_eq!(replayed.get_proposal(&general).unwrap().status, ProposalStatus::Passed);
        assert_eq!(replayed.get_proposal(&grant).unwrap().status, ProposalStatus::Passed);
        assert_eq!(replayed.balance_of("dave"), 2_000);
    }

    #[test]
    fn test_full_u64_supply() {
        let mut cfg = config();
        cfg.treasury.initial_balance = 0;
        cfg.allocations = vec![Allocation {
            address: "whale".to_string(),
            amount: u64::MAX,
        }];
        cfg.validate().unwrap();
        let state = ChainState::in_memory(&cfg, ManualClock::at(T0 + 10)).unwrap();
        assert_eq!(state.total_supply(), u64::MAX);

        let mut quadratic = draft(ProposalType::General, None);
        quadratic.voting_type = VotingType::Quadratic;
        let id = state.submit_proposal("whale", quadratic).unwrap().tx_hash.to_hex();
        state.submit_vote("whale", &id, VoteChoice::Yes).unwrap();

        let listed = state.list_proposals();
        assert_eq!(listed[0].status, ProposalStatus::Passed);
        assert_eq!(listed[0].tally().yes, 4_294_967_295);
        assert_eq!(state.voting_power("whale"), (u64::MAX, 0));
    }

    #[test]
    fn test_external_vote_with_prefixed_uppercase_id() {
        let (state, _) = chain();
        let id = state
            .submit_proposal("alice", draft(ProposalType::General, None))
            .unwrap()
            .tx_hash
            .to_hex();

        let tip = state.tip().unwrap();
        let tx = Transaction::new(
            "bob",
            state.nonce_of("bob"),
            tip.timestamp,
            TxPayload::Vote {
                proposal_id: format!("0x{}", id.to_uppercase()),
                choice: VoteChoice::No,
            },
        );
        let block = Block::seal(tip.height + 1, Some(tip.hash), tip.timestamp, vec![tx]);
        state.append_block(block).unwrap();
        assert_eq!(state.tally(&id).unwrap().no, 1_000);

        // The same voter under the canonical id is still a duplicate
        assert!(matches!(
            state.submit_vote("bob", &id, VoteChoice::Yes),
            Err(LedgerError::DuplicateVote { .. })
        ));
        assert!(state.submit_vote("carol", "not-a-proposal", VoteChoice::Yes).is_err());
    }

    #[test]
    fn test_delegated_votes_carry_lent_power() {
        let (state, clock) = chain();
        let id = state
            .submit_proposal("carol", draft(ProposalType::General, None))
            .unwrap()
            .tx_hash
            .to_hex();

        let receipt = state.submit_delegation("alice", "bob", 86_400).unwrap();
        assert_eq!(receipt.kind, "delegate");
        assert_eq!(state.voting_power("bob"), (1_000, 1_000));
        assert_eq!(state.voting_power("alice"), (0, 0));
        assert_eq!(state.active_delegations().len(), 1);

        assert!(matches!(
            state.submit_vote("alice", &id, VoteChoice::No),
            Err(LedgerError::Unauthorized(_))
        ));
        state.submit_vote("bob", &id, VoteChoice::Yes).unwrap();
        assert_eq!(state.tally(&id).unwrap().yes, 2_000);

        assert!(matches!(
            state.submit_delegation("bob", "carol", 60),
            Err(LedgerError::InvalidDelegation(_))
        ));
        assert!(matches!(
            state.submit_delegation("carol", "nobody", 60),
            Err(LedgerError::InvalidDelegation(_))
        ));

        clock.advance(5);
        state.submit_revoke_delegation("alice").unwrap();
        assert!(state.active_delegations().is_empty());
        assert_eq!(state.get_delegation("alice").unwrap().revoked_at, Some(clock.now()));
        assert!(matches!(
            state.submit_vote("alice", &id, VoteChoice::No),
            Err(LedgerError::DuplicateVote { .. })
        ));
        assert!(matches!(
            state.submit_revoke_delegation("alice"),
            Err(LedgerError::InvalidDelegation(_))
        ));
        assert!(matches!(state.get_delegation("carol"), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_delegation_lapses_on_its_own() {
        let (state, clock) = chain();
        state.submit_delegation("alice", "bob", 60).unwrap();
        clock.advance(60);
        assert_eq!(state.voting_power("bob"), (1_000, 0));
        assert_eq!(state.voting_power("alice"), (1_000, 0));

        let id = state
            .submit_proposal("bob", draft(ProposalType::General, None))
            .unwrap()
            .tx_hash
            .to_hex();
        state.submit_vote("alice", &id, VoteChoice::Yes).unwrap();
        // A fresh delegation is allowed once the old one lapsed
        state.submit_delegation("alice", "carol", 60).unwrap();
        assert_eq!(state.get_delegation("alice").unwrap().delegate, "carol");
    }

    #[test]
    fn test_concurrent_votes_from_one_voter_count_once() {
        let (state, _) = chain();
        let id = state
            .submit_proposal("bob", draft(ProposalType::General, None))
            .unwrap()
            .tx_hash
            .to_hex();

        let results: Vec<LedgerResult<TxReceipt>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let (state, id) = (&state, &id);
                    let choice = if i % 2 == 0 { VoteChoice::Yes } else { VoteChoice::No };
                    s.spawn(move || state.submit_vote("alice", id, choice))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(LedgerError::DuplicateVote { .. }))));
        let tally = state.tally(&id).unwrap();
        assert_eq!((tally.voters, tally.cast), (1, 1_000));
        assert_eq!(state.nonce_of("alice"), 1);
    }

    #[test]
    fn test_concurrent_transfers_get_distinct_nonces() {
        let (state, _) = chain();
        let results: Vec<LedgerResult<TxReceipt>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..10)
                .map(|_| s.spawn(|| state.submit_transfer("carol", "dave", 10)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(state.balance_of("dave"), 100);
        assert_eq!(state.nonce_of("carol"), 10);
        assert_eq!(state.height(), 10);
    }

    #[test]
    fn test_readers_never_see_partial_commits() {
        let (state, _) = chain();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let writer = s.spawn(|| {
                for i in 0..200u64 {
                    let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
                    state.submit_transfer(from, to, 1 + i % 7).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });
            for _ in 0..3 {
                s.spawn(|| {
                    let mut last_height = 0;
                    loop {
                        let finished = done.load(Ordering::SeqCst);
                        let ledger = state.ledger_snapshot();
                        assert_eq!(ledger.balance_sum(), ledger.total_supply());
                        assert_eq!(ledger.balance_of("alice") + ledger.balance_of("bob"), 2_000);
                        let height = state.height();
                        assert!(height >= last_height);
                        last_height = height;
                        if finished {
                            break;
                        }
                    }
                });
            }
            writer.join().unwrap();
        });
        assert_eq!(state.height(), 200);
    }

    #[test]
    fn test_proposals_listed_in_creation_order() {
        let (state, _) = chain();
        let a = state.submit_proposal("alice", draft(ProposalType::General, None)).unwrap();
        let b = state.submit_proposal("bob", draft(ProposalType::Technical, None)).unwrap();
        let ids: Vec<String> = state.list_proposals().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a.tx_hash.to_hex(), b.tx_hash.to_hex()]);

        let mut bad = draft(ProposalType::General, None);
        bad.threshold = 150;
        assert!(matches!(
            state.submit_proposal("alice", bad),
            Err(LedgerError::InvalidProposal(_))
        ));
        assert!(matches!(state.get_proposal(&H256([1; 32]).to_hex()), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_treasury_payout_flow() {
        let (state, _) = chain();
        let funding = Funding {
            recipient: "dave".to_string(),
            amount: 2_000,
        };
        let id = state
            .submit_proposal("alice", draft(ProposalType::Treasury, Some(funding)))
            .unwrap()
            .tx_hash
            .to_hex();

        // Not passed yet
        assert!(matches!(
            state.submit_treasury_transfer("alice", &id, "dave", 2_000),
            Err(LedgerError::InvalidProposal(_))
        ));

        // carol holds 80% of the electorate, which closes the vote at once
        state.submit_vote("carol", &id, VoteChoice::Yes).unwrap();
        assert_eq!(state.get_proposal(&id).unwrap().status, ProposalStatus::Passed);

        assert!(state.submit_treasury_transfer("alice", &id, "mallory", 2_000).is_err());
        let receipt = state.submit_treasury_transfer("alice", &id, "dave", 2_000).unwrap();
        assert_eq!(receipt.kind, "treasury_transfer");
        assert_eq!(state.treasury_balance(), 3_000);
        assert_eq!(state.balance_of("dave"), 2_000);
        assert_eq!(state.funded_proposals(), 1);
        assert_eq!(state.get_proposal(&id).unwrap().funded_by, Some(receipt.tx_hash));

        // One payout per proposal
        assert!(state.submit_treasury_transfer("bob", &id, "dave", 2_000).is_err());
        assert_eq!(state.treasury_balance(), 3_000);
    }

    #[test]
    fn test_treasury_cannot_send_or_vote() {
        let (state, _) = chain();
        assert!(matches!(
            state.submit_transfer(TREASURY_ADDRESS, "alice", 1),
            Err(LedgerError::Unauthorized(_))
        ));
        assert!(matches!(
            state.submit_transfer("alice", TREASURY_ADDRESS, 1),
            Err(LedgerError::Unauthorized(_))
        ));
        assert_eq!(state.treasury_balance(), 5_000);
    }

    #[test]
    fn test_recovery_replays_block_log() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0 + 10);
        let cfg = config();

        let (tip, id) = {
            let state = ChainState::open(dir.path(), &cfg, clock.clone()).unwrap();
            state.submit_transfer("alice", "dave", 100).unwrap();
            state.submit_transfer("carol", "dave", 50).unwrap();
            let id = state
                .submit_proposal("bob", draft(ProposalType::General, None))
                .unwrap()
                .tx_hash
                .to_hex();
            state.submit_vote("alice", &id, VoteChoice::No).unwrap();
            state.submit_transfer("dave", "erin", 5).unwrap();
            (state.tip().unwrap(), id)
        };
        assert!(dir.path().join("checkpoint.json").exists());

        let reopened = ChainState::open(dir.path(), &cfg, clock.clone()).unwrap();
        assert_eq!(reopened.tip(), Some(tip));
        assert_eq!(reopened.balance_of("dave"), 145);
        assert_eq!(reopened.nonce_of("alice"), 2);
        assert_eq!(reopened.tally(&id).unwrap().no, 900);
        assert_eq!(reopened.status().transactions, 9);

        // Without the checkpoint the full replay lands on the same state
        std::fs::remove_file(dir.path().join("checkpoint.json")).unwrap();
        let replayed = ChainState::open(dir.path(), &cfg, clock).unwrap();
        assert_eq!(replayed.tip(), Some(tip));
        assert_eq!(replayed.balance_of("erin"), 5);
        assert_eq!(replayed.list_proposals().len(), 1);
    }

    #[test]
    fn test_recovery_survives_torn_write() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0 + 10);
        let cfg = config();
        let tip = {
            let state = ChainState::open(dir.path(), &cfg, clock.clone()).unwrap();
            state.submit_transfer("alice", "bob", 1).unwrap();
            state.tip().unwrap()
        };
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("blocks.jsonl"))
            .unwrap();
        log.write_all(b"{\"height\":2,\"ha").unwrap();
        drop(log);

        let state = ChainState::open(dir.path(), &cfg, clock).unwrap();
        assert_eq!(state.tip(), Some(tip));
        state.submit_transfer("alice", "bob", 1).unwrap();
        assert_eq!(state.height(), 2);
    }

    #[test]
    fn test_rejected_block_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0 + 10);
        let cfg = config();
        {
            let state = ChainState::open(dir.path(), &cfg, clock.clone()).unwrap();
            assert!(state.submit_transfer("bob", "alice", 5_000).is_err());
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.read_blocks().unwrap().len(), 1);
    }
}
