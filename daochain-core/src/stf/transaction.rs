//! Transaction types for the DAO chain

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::governance::{ProposalDraft, VoteChoice};
use super::types::{hash_str, H256};

/// Kind-specific transaction body
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxPayload {
    /// Create tokens; only valid in the genesis block
    Mint { to: String, amount: u64 },

    /// Move tokens between accounts
    Transfer { to: String, amount: u64 },

    /// Open a governance proposal; the proposal id is this transaction's hash
    ProposalCreate(ProposalDraft),

    /// Vote on an open proposal
    Vote { proposal_id: String, choice: VoteChoice },

    /// Pay out a passed treasury proposal
    TreasuryTransfer {
        proposal_id: String,
        to: String,
        amount: u64,
    },

    /// Lend the sender's voting power to `delegate` for `duration` seconds
    Delegate { delegate: String, duration: u64 },

    /// End the sender's active delegation
    RevokeDelegation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxKind {
    Mint,
    Transfer,
    ProposalCreate,
    Vote,
    TreasuryTransfer,
    Delegate,
    RevokeDelegation,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Mint => "mint",
            TxKind::Transfer => "transfer",
            TxKind::ProposalCreate => "proposal_create",
            TxKind::Vote => "vote",
            TxKind::TreasuryTransfer => "treasury_transfer",
            TxKind::Delegate => "delegate",
            TxKind::RevokeDelegation => "revoke_delegation",
        }
    }
}

/// A transaction as included in a block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Digest over every field except `hash` and `block_hash`
    pub hash: H256,

    /// Owning block; zero until sealed into one
    pub block_hash: H256,

    pub from: String,

    /// Sender's account sequence number
    pub nonce: u64,

    pub timestamp: u64,

    #[serde(flatten)]
    pub payload: TxPayload,
}

impl Transaction {
    pub fn new(from: impl Into<String>, nonce: u64, timestamp: u64, payload: TxPayload) -> Self {
        let mut tx = Self {
            hash: H256::ZERO,
            block_hash: H256::ZERO,
            from: from.into(),
            nonce,
            timestamp,
            payload,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    pub fn kind(&self) -> TxKind {
        match self.payload {
            TxPayload::Mint { .. } => TxKind::Mint,
            TxPayload::Transfer { .. } => TxKind::Transfer,
            TxPayload::ProposalCreate(_) => TxKind::ProposalCreate,
            TxPayload::Vote { .. } => TxKind::Vote,
            TxPayload::TreasuryTransfer { .. } => TxKind::TreasuryTransfer,
            TxPayload::Delegate { .. } => TxKind::Delegate,
            TxPayload::RevokeDelegation => TxKind::RevokeDelegation,
        }
    }

    /// Credited account, for value-moving kinds
    #[cfg(test)]
    pub fn to(&self) -> Option<&str> {
        match &self.payload {
            TxPayload::Mint { to, .. }
            | TxPayload::Transfer { to, .. }
            | TxPayload::TreasuryTransfer { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Amount moved, for value-moving kinds
    #[cfg(test)]
    pub fn amount(&self) -> Option<u64> {
        match &self.payload {
            TxPayload::Mint { amount, .. }
            | TxPayload::Transfer { amount, .. }
            | TxPayload::TreasuryTransfer { amount, .. } => Some(*amount),
            _ => None,
        }
    }

    /// Compute the canonical hash of this transaction
    pub fn compute_hash(&self) -> H256 {
        let mut hasher = Sha256::new();
        hasher.update(b"daochain-tx");
        hash_str(&mut hasher, &self.from);
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());

        match &self.payload {
            TxPayload::Mint { to, amount } => {
                hasher.update(b"mint");
                hash_str(&mut hasher, to);
                hasher.update(amount.to_le_bytes());
            }
            TxPayload::Transfer { to, amount } => {
                hasher.update(b"transfer");
                hash_str(&mut hasher, to);
                hasher.update(amount.to_le_bytes());
            }
            TxPayload::ProposalCreate(draft) => {
                hasher.update(b"proposal_create");
                hash_str(&mut hasher, &draft.title);
                hash_str(&mut hasher, &draft.description);
                hash_str(&mut hasher, draft.proposal_type.as_str());
                hash_str(&mut hasher, draft.voting_type.as_str());
                hasher.update(draft.duration.to_le_bytes());
                hasher.update(draft.threshold.to_le_bytes());
                if let Some(ref funding) = draft.funding {
                    hasher.update([1u8]);
                    hash_str(&mut hasher, &funding.recipient);
                    hasher.update(funding.amount.to_le_bytes());
                } else {
                    hasher.update([0u8]);
                }
            }
            TxPayload::Vote { proposal_id, choice } => {
                hasher.update(b"vote");
                hash_str(&mut hasher, proposal_id);
                hash_str(&mut hasher, choice.as_str());
            }
            TxPayload::TreasuryTransfer {
                proposal_id,
                to,
                amount,
            } => {
                hasher.update(b"treasury_transfer");
                hash_str(&mut hasher, proposal_id);
                hash_str(&mut hasher, to);
                hasher.update(amount.to_le_bytes());
            }
            TxPayload::Delegate { delegate, duration } => {
                hasher.update(b"delegate");
                hash_str(&mut hasher, delegate);
                hasher.update(duration.to_le_bytes());
            }
            TxPayload::RevokeDelegation => {
                hasher.update(b"revoke_delegation");
            }
        }

        hasher.into()
    }
}

/// Outcome of a committed write
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_hash: H256,
    pub block_height: u64,
    pub kind: String,
}
