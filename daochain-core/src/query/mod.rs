//! Read-only query surface
//!
//! Every lookup validates its raw input before touching the chain, so callers
//! get `InvalidFormat` for malformed identifiers and `NotFound` only for
//! well-formed ones that are absent.

use serde::Serialize;

use crate::stf::{
    normalize_proposal_id, validate_address, Block, ChainState, ChainStatus, Delegation, LedgerResult, LookupKey,
    Proposal, Tally, Transaction, Vote, H256, TREASURY_ADDRESS,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BalanceView {
    pub address: String,
    pub balance: u64,
    /// Next nonce the account will send with
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreasuryView {
    pub address: &'static str,
    pub balance: u64,
    pub funded_proposals: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SupplyView {
    pub total_supply: u64,
}

/// Proposal tally together with its current status
#[derive(Clone, Debug, Serialize)]
pub struct TallyView {
    pub proposal_id: String,
    pub status: crate::stf::ProposalStatus,
    #[serde(flatten)]
    pub tally: Tally,
}

#[derive(Clone, Debug, Serialize)]
pub struct DelegationView {
    #[serde(flatten)]
    pub delegation: Delegation,
    pub active: bool,
}

/// Token balance an address can vote with, split by origin
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VotingPowerView {
    pub address: String,
    pub own: u64,
    pub delegated: u64,
    pub effective: u64,
}

#[derive(Clone)]
pub struct QueryFacade {
    chain: ChainState,
}

impl QueryFacade {
    pub fn new(chain: ChainState) -> Self {
        Self { chain }
    }

    /// Block by hex hash or decimal height
    pub fn block(&self, hash_or_height: &str) -> LedgerResult<Block> {
        let key: LookupKey = hash_or_height.parse()?;
        self.chain.get_block(&key)
    }

    pub fn transaction(&self, hash: &str) -> LedgerResult<Transaction> {
        let hash = H256::from_hex(hash)?;
        self.chain.get_transaction(&hash)
    }

    pub fn balance(&self, address: &str) -> LedgerResult<BalanceView> {
        validate_address(address)?;
        Ok(BalanceView {
            address: address.to_string(),
            balance: self.chain.balance_of(address),
            nonce: self.chain.nonce_of(address),
        })
    }

    pub fn treasury(&self) -> TreasuryView {
        TreasuryView {
            address: TREASURY_ADDRESS,
            balance: self.chain.treasury_balance(),
            funded_proposals: self.chain.funded_proposals(),
        }
    }

    pub fn supply(&self) -> SupplyView {
        SupplyView {
            total_supply: self.chain.total_supply(),
        }
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        self.chain.list_proposals()
    }

    pub fn proposal(&self, id: &str) -> LedgerResult<Proposal> {
        let id = normalize_proposal_id(id)?;
        self.chain.get_proposal(&id)
    }

    /// Votes on a proposal, ordered by voter
    pub fn votes(&self, id: &str) -> LedgerResult<Vec<Vote>> {
        Ok(self.proposal(id)?.votes.into_values().collect())
    }

    pub fn tally(&self, id: &str) -> LedgerResult<TallyView> {
        let id = normalize_proposal_id(id)?;
        let proposal = self.chain.get_proposal(&id)?;
        Ok(TallyView {
            tally: proposal.tally(),
            status: proposal.status,
            proposal_id: id,
        })
    }

    /// Latest delegation made by `delegator`, flagged active or not
    pub fn delegation(&self, delegator: &str) -> LedgerResult<DelegationView> {
        validate_address(delegator)?;
        let delegation = self.chain.get_delegation(delegator)?;
        Ok(DelegationView {
            active: delegation.is_active_at(self.chain.now()),
            delegation,
        })
    }

    pub fn delegations(&self) -> Vec<DelegationView> {
        self.chain
            .active_delegations()
            .into_iter()
            .map(|delegation| DelegationView {
                delegation,
                active: true,
            })
            .collect()
    }

    pub fn voting_power(&self, address: &str) -> LedgerResult<VotingPowerView> {
        validate_address(address)?;
        let (own, delegated) = self.chain.voting_power(address);
        Ok(VotingPowerView {
            address: address.to_string(),
            own,
            delegated,
            effective: own.saturating_add(delegated),
        })
    }

    pub fn status(&self) -> ChainStatus {
        self.chain.status()
    }
}
