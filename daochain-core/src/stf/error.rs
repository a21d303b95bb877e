//! Ledger error taxonomy
//!
//! Every rejected operation maps to exactly one of these. None of them are
//! fatal to the node: a rejected block or write leaves state untouched.

use thiserror::Error;

use super::types::H256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed identifier, address or payload field
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Well-formed but absent
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key {0}")]
    DuplicateKey(H256),

    #[error("duplicate transaction {0}")]
    DuplicateTransaction(H256),

    #[error("{voter} has already voted on proposal {proposal_id}")]
    DuplicateVote { proposal_id: String, voter: String },

    /// Block does not extend the current tip
    #[error(
        "block does not extend tip: expected height {expected_height} with parent {expected_parent:?}, \
         got height {height} with parent {parent:?}"
    )]
    ChainForkRejected {
        expected_height: u64,
        expected_parent: Option<H256>,
        height: u64,
        parent: Option<H256>,
    },

    #[error("insufficient balance: {address} holds {available}, needs {required}")]
    InsufficientBalance {
        address: String,
        available: u64,
        required: u64,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// Self-delegation, chained delegation, bad duration, nothing to revoke
    #[error("invalid delegation: {0}")]
    InvalidDelegation(String),

    #[error("proposal {0} is closed")]
    ProposalClosed(String),

    #[error("invalid nonce for {address}: expected {expected}, got {got}")]
    InvalidNonce {
        address: String,
        expected: u64,
        got: u64,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Structural integrity failure (hash mismatch, bad linkage, misplaced mint)
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether the caller may retry the same request unchanged (after
    /// re-reading the tip, for forks).
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ChainForkRejected { .. } | LedgerError::Storage(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
