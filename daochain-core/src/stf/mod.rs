//! State Transition Function (STF) for the DAO chain
//!
//! This module defines the core state machine that:
//! - Indexes blocks and transactions by hash and height
//! - Keeps token balances derived from applied transactions
//! - Appends blocks all-or-nothing on a single chain
//! - Runs proposal creation, voting, tallying and treasury payouts

mod block;
mod error;
mod governance;
mod index;
mod ledger;
mod state;
mod transaction;
mod types;

pub use block::Block;
pub use error::{LedgerError, LedgerResult};
pub use governance::{
    normalize_proposal_id, Delegation, Funding, GovernanceParams, GovernanceState, Proposal, ProposalDraft,
    ProposalStatus, ProposalType, Tally, Vote, VoteChoice, VotingType,
};
pub use index::HashIndex;
pub use ledger::TokenLedger;
pub use state::{ChainState, ChainStatus, ChainTip};
pub use transaction::{Transaction, TxKind, TxPayload, TxReceipt};
pub use types::{validate_address, Clock, LookupKey, SystemClock, GENESIS_ADDRESS, H256, TREASURY_ADDRESS};
#[cfg(test)]
pub use types::ManualClock;
