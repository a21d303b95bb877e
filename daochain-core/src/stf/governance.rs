//! DAO Governance Engine
//!
//! Token holders create proposals, vote on them and may lend their voting
//! power to another holder for a while. Vote weight is read from the token
//! ledger when the vote is cast. Past its deadline a proposal's outcome is a
//! pure function of its votes and the electorate as it stood at the deadline,
//! so reads agree before and after the status is written down by `tick`.
//! Early closes are only decided when a block is applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{LedgerError, LedgerResult};
use super::ledger::TokenLedger;
use super::types::{validate_address, GENESIS_ADDRESS, H256, TREASURY_ADDRESS};

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

/// Longest a delegation may last: one year
pub const MAX_DELEGATION_SECS: u64 = 365 * 24 * 3600;

/// Canonical form of a proposal id: 64 lowercase hex characters, no `0x`
pub fn normalize_proposal_id(id: &str) -> LedgerResult<String> {
    Ok(H256::from_hex(id)?.to_hex())
}

/// Tunable governance rules
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceParams {
    /// Minimum creator balance to open a proposal
    pub min_proposal_balance: u64,

    /// Longest voting period a proposal may request
    pub max_duration_secs: u64,

    /// Share of the electorate (0-100) that must vote for a result to count
    pub quorum_percent: u8,
}

impl Default for GovernanceParams {
    fn default() -> Self {
        Self {
            min_proposal_balance: 0,
            max_duration_secs: 30 * 24 * 3600,
            quorum_percent: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    General,
    /// Spends treasury funds once passed
    Treasury,
    Technical,
    Parameter,
}

impl ProposalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalType::General => "general",
            ProposalType::Treasury => "treasury",
            ProposalType::Technical => "technical",
            ProposalType::Parameter => "parameter",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingType {
    /// One holder, one vote
    Simple,
    /// Weight = token balance
    #[default]
    #[serde(alias = "token-based", alias = "token_based")]
    Weighted,
    /// Weight = integer square root of balance
    Quadratic,
}

impl VotingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingType::Simple => "simple",
            VotingType::Weighted => "weighted",
            VotingType::Quadratic => "quadratic",
        }
    }

    /// Voting power of a holder with `balance` tokens
    pub fn weight(&self, balance: u64) -> u64 {
        if balance == 0 {
            return 0;
        }
        match self {
            VotingType::Simple => 1,
            VotingType::Weighted => balance,
            VotingType::Quadratic => isqrt(balance),
        }
    }
}

/// Floor of the square root, by Newton iteration.
pub fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut x = n;
    // (n + 1) / 2 without overflowing at u64::MAX
    let mut y = n / 2 + (n & 1);
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Voting is open
    Open,
    Passed,
    Rejected,
    /// Deadline passed without enough participation
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

impl VoteChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteChoice::Yes => "yes",
            VoteChoice::No => "no",
            VoteChoice::Abstain => "abstain",
        }
    }
}

/// Treasury payout requested by a treasury proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funding {
    pub recipient: String,
    pub amount: u64,
}

/// Proposal fields as submitted by the creator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub title: String,
    pub description: String,
    pub proposal_type: ProposalType,
    #[serde(default)]
    pub voting_type: VotingType,
    /// Voting period in seconds
    pub duration: u64,
    /// Percentage (0-100) of cast power the winning side needs
    pub threshold: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<Funding>,
}

impl ProposalDraft {
    pub fn validate(&self, params: &GovernanceParams) -> LedgerResult<()> {
        let invalid = |msg: String| Err(LedgerError::InvalidProposal(msg));

        if self.title.trim().is_empty() || self.title.len() > MAX_TITLE_LEN {
            return invalid(format!("title must be 1-{} characters", MAX_TITLE_LEN));
        }
        if self.description.trim().is_empty() || self.description.len() > MAX_DESCRIPTION_LEN {
            return invalid(format!("description must be 1-{} characters", MAX_DESCRIPTION_LEN));
        }
        if self.duration == 0 {
            return invalid("duration must be positive".to_string());
        }
        if self.duration > params.max_duration_secs {
            return invalid(format!(
                "duration {}s exceeds maximum {}s",
                self.duration, params.max_duration_secs
            ));
        }
        if self.threshold > 100 {
            return invalid(format!("threshold {} is not a percentage", self.threshold));
        }
        match (&self.proposal_type, &self.funding) {
            (ProposalType::Treasury, None) => {
                return invalid("treasury proposals must request funding".to_string());
            }
            (ProposalType::Treasury, Some(funding)) => {
                validate_address(&funding.recipient)
                    .map_err(|e| LedgerError::InvalidProposal(format!("funding recipient: {}", e)))?;
                if funding.amount == 0 {
                    return invalid("funding amount must be positive".to_string());
                }
            }
            (other, Some(_)) => {
                return invalid(format!("{} proposals cannot request funding", other.as_str()));
            }
            (_, None) => {}
        }
        Ok(())
    }
}

/// A recorded vote
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: String,
    pub choice: VoteChoice,
    /// Voter's power when the vote was cast
    pub weight: u64,
    pub timestamp: u64,
    pub tx_hash: H256,
    /// Delegators whose balances this vote carried
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegators: Vec<String>,
}

/// What a vote is weighted from: a balance, and the delegators it includes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteBasis {
    pub balance: u64,
    pub delegators: Vec<String>,
}

impl From<u64> for VoteBasis {
    fn from(balance: u64) -> Self {
        Self {
            balance,
            delegators: Vec::new(),
        }
    }
}

/// Total voting power available per voting type, excluding reserved accounts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Electorate {
    pub holders: u64,
    pub weighted: u64,
    pub quadratic: u64,
}

impl Electorate {
    pub fn power(&self, voting_type: VotingType) -> u64 {
        match voting_type {
            VotingType::Simple => self.holders,
            VotingType::Weighted => self.weighted,
            VotingType::Quadratic => self.quadratic,
        }
    }

    fn count(&mut self, balance: u64) {
        if balance == 0 {
            return;
        }
        self.holders += 1;
        self.weighted = self.weighted.saturating_add(balance);
        self.quadratic = self.quadratic.saturating_add(isqrt(balance));
    }
}

/// Anything that can say how large the electorate was at a given time
pub trait ElectorateSource {
    fn electorate_at(&self, at: u64) -> Electorate;
}

impl ElectorateSource for Electorate {
    fn electorate_at(&self, _at: u64) -> Electorate {
        *self
    }
}

/// A delegator lending its whole balance to a delegate for a time window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub delegator: String,
    pub delegate: String,
    pub start_time: u64,
    pub end_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
    pub tx_hash: H256,
}

impl Delegation {
    pub fn is_active_at(&self, at: u64) -> bool {
        self.start_time <= at && at < self.end_time && self.revoked_at.map_or(true, |r| at < r)
    }
}

/// Latest delegation per delegator. A delegator has at most one record;
/// a new delegation replaces an expired or revoked one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelegationBook {
    entries: BTreeMap<String, Delegation>,
}

impl DelegationBook {
    /// Latest delegation record made by `delegator`, active or not
    pub fn get(&self, delegator: &str) -> Option<&Delegation> {
        self.entries.get(delegator)
    }

    /// Who `delegator` is lending its power to at `at`, if anyone
    pub fn active_delegate(&self, delegator: &str, at: u64) -> Option<&str> {
        self.entries
            .get(delegator)
            .filter(|d| d.is_active_at(at))
            .map(|d| d.delegate.as_str())
    }

    /// Delegations into `delegate` that are active at `at`
    pub fn delegators_of<'a>(&'a self, delegate: &'a str, at: u64) -> impl Iterator<Item = &'a Delegation> + 'a {
        self.entries
            .values()
            .filter(move |d| d.delegate == delegate && d.is_active_at(at))
    }

    /// Every delegation active at `at`, ordered by delegator
    pub fn active(&self, at: u64) -> impl Iterator<Item = &Delegation> + '_ {
        self.entries.values().filter(move |d| d.is_active_at(at))
    }
}

/// Ledger balances seen through the delegations in force
pub struct VotingPower<'a> {
    ledger: &'a TokenLedger,
    delegations: &'a DelegationBook,
}

impl<'a> VotingPower<'a> {
    pub fn new(ledger: &'a TokenLedger, delegations: &'a DelegationBook) -> Self {
        Self { ledger, delegations }
    }

    /// Own balance still usable by `address`; zero while it is lent out
    pub fn own(&self, address: &str, at: u64) -> u64 {
        if self.delegations.active_delegate(address, at).is_some() {
            return 0;
        }
        self.ledger.balance_of(address)
    }

    /// Balances lent to `address` by its delegators
    pub fn delegated(&self, address: &str, at: u64) -> u64 {
        self.delegations
            .delegators_of(address, at)
            .fold(0u64, |acc, d| acc.saturating_add(self.ledger.balance_of(&d.delegator)))
    }

    pub fn effective_balance(&self, address: &str, at: u64) -> u64 {
        self.own(address, at).saturating_add(self.delegated(address, at))
    }

    /// Balance `voter` may put behind a vote on `proposal`. A delegator
    /// whose power was already used on it is left out.
    pub fn vote_balance(&self, voter: &str, at: u64, proposal: &Proposal) -> VoteBasis {
        let mut basis = VoteBasis::from(self.own(voter, at));
        for d in self.delegations.delegators_of(voter, at) {
            if proposal.power_used_by(&d.delegator) {
                continue;
            }
            basis.balance = basis.balance.saturating_add(self.ledger.balance_of(&d.delegator));
            basis.delegators.push(d.delegator.clone());
        }
        basis
    }
}

impl ElectorateSource for VotingPower<'_> {
    fn electorate_at(&self, at: u64) -> Electorate {
        let mut effective: BTreeMap<&str, u64> = self.ledger.holdings().collect();
        for d in self.delegations.active(at) {
            if let Some(lent) = effective.insert(d.delegator.as_str(), 0) {
                let entry = effective.entry(d.delegate.as_str()).or_insert(0);
                *entry = entry.saturating_add(lent);
            }
        }
        let mut electorate = Electorate::default();
        for balance in effective.values() {
            electorate.count(*balance);
        }
        electorate
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub yes: u64,
    pub no: u64,
    pub abstain: u64,
    /// yes + no + abstain
    pub cast: u64,
    pub voters: usize,
    pub threshold: u8,
    /// Yes strictly beats no and reaches threshold% of cast power
    pub threshold_met: bool,
}

/// A governance proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Hex hash of the creating transaction
    pub id: String,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub proposal_type: ProposalType,
    pub voting_type: VotingType,
    pub duration: u64,
    pub threshold: u8,
    pub status: ProposalStatus,
    pub created_at: u64,
    pub voting_ends_at: u64,
    pub created_height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding: Option<Funding>,
    /// voter -> vote; at most one entry per voter
    pub votes: BTreeMap<String, Vote>,
    /// Treasury transaction that paid out this proposal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funded_by: Option<H256>,
}

impl Proposal {
    pub fn new(id: String, creator: String, draft: ProposalDraft, created_at: u64, created_height: u64) -> Self {
        Self {
            id,
            creator,
            title: draft.title,
            description: draft.description,
            proposal_type: draft.proposal_type,
            voting_type: draft.voting_type,
            duration: draft.duration,
            // validated <= 100
            threshold: draft.threshold.min(100) as u8,
            status: ProposalStatus::Open,
            created_at,
            voting_ends_at: created_at.saturating_add(draft.duration),
            created_height,
            funding: draft.funding,
            votes: BTreeMap::new(),
            funded_by: None,
        }
    }

    pub fn tally(&self) -> Tally {
        let (mut yes, mut no, mut abstain) = (0u64, 0u64, 0u64);
        for vote in self.votes.values() {
            match vote.choice {
                VoteChoice::Yes => yes = yes.saturating_add(vote.weight),
                VoteChoice::No => no = no.saturating_add(vote.weight),
                VoteChoice::Abstain => abstain = abstain.saturating_add(vote.weight),
            }
        }
        let cast = yes.saturating_add(no).saturating_add(abstain);
        let threshold_met = yes > no && (yes as u128) * 100 >= (self.threshold as u128) * (cast as u128);
        Tally {
            yes,
            no,
            abstain,
            cast,
            voters: self.votes.len(),
            threshold: self.threshold,
            threshold_met,
        }
    }

    /// Whether `address` voted, or had its power carried by a delegate's vote
    pub fn power_used_by(&self, address: &str) -> bool {
        self.votes.contains_key(address)
            || self
                .votes
                .values()
                .any(|v| v.delegators.iter().any(|d| d == address))
    }

    /// Record a vote. One vote per voter, never overwritten.
    fn add_vote(
        &mut self,
        vote: Vote,
        now: u64,
        electorate: &dyn ElectorateSource,
        params: &GovernanceParams,
    ) -> LedgerResult<ProposalStatus> {
        if evaluate_status(self, now, electorate, params) != ProposalStatus::Open {
            return Err(LedgerError::ProposalClosed(self.id.clone()));
        }
        match self.votes.entry(vote.voter.clone()) {
            std::collections::btree_map::Entry::Occupied(_) => {
                return Err(LedgerError::DuplicateVote {
                    proposal_id: self.id.clone(),
                    voter: vote.voter,
                });
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(vote);
            }
        }
        if let Some(decided) = decisive_status(self, &electorate.electorate_at(now)) {
            self.status = decided;
        }
        Ok(self.status)
    }
}

/// Early close: the outcome is decisive against the whole electorate when
/// yes holds more than half of it and at least threshold% of it (passed), or
/// no holds at least half (rejected).
fn decisive_status(proposal: &Proposal, electorate: &Electorate) -> Option<ProposalStatus> {
    let tally = proposal.tally();
    let power = electorate.power(proposal.voting_type) as u128;
    let (yes, no) = (tally.yes as u128, tally.no as u128);
    if power == 0 {
        return None;
    }
    if yes * 2 > power && yes * 100 >= (proposal.threshold as u128) * power {
        return Some(ProposalStatus::Passed);
    }
    if no * 2 >= power {
        return Some(ProposalStatus::Rejected);
    }
    None
}

/// Status of `proposal` as of `now`.
///
/// A recorded terminal status is final. Before the deadline an open proposal
/// stays open. From the deadline on the electorate is taken as it stood at
/// the deadline: nothing cast or quorum unmet is expired, a met threshold is
/// passed, anything else (ties included) is rejected.
pub fn evaluate_status(
    proposal: &Proposal,
    now: u64,
    electorate: &dyn ElectorateSource,
    params: &GovernanceParams,
) -> ProposalStatus {
    if proposal.status != ProposalStatus::Open || now < proposal.voting_ends_at {
        return proposal.status;
    }
    let tally = proposal.tally();
    let power = electorate
        .electorate_at(proposal.voting_ends_at)
        .power(proposal.voting_type) as u128;
    let cast = tally.cast as u128;
    if cast == 0 || cast * 100 < (params.quorum_percent as u128) * power {
        return ProposalStatus::Expired;
    }
    if tally.threshold_met {
        ProposalStatus::Passed
    } else {
        ProposalStatus::Rejected
    }
}

fn settled_status(
    proposal: &Proposal,
    now: u64,
    electorate: &dyn ElectorateSource,
    current: &Electorate,
    params: &GovernanceParams,
) -> ProposalStatus {
    if proposal.status != ProposalStatus::Open {
        return proposal.status;
    }
    if now >= proposal.voting_ends_at {
        return evaluate_status(proposal, now, electorate, params);
    }
    decisive_status(proposal, current).unwrap_or(ProposalStatus::Open)
}

/// Governance state: parameters, every proposal ever created, and delegations
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceState {
    pub params: GovernanceParams,

    /// All proposals in creation order; never pruned
    pub proposals: Vec<Proposal>,

    #[serde(default)]
    pub delegations: DelegationBook,
}

impl GovernanceState {
    pub fn with_params(params: GovernanceParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Open a new proposal with the given id
    pub fn create_proposal(
        &mut self,
        id: String,
        creator: &str,
        draft: ProposalDraft,
        creator_balance: u64,
        now: u64,
        height: u64,
    ) -> LedgerResult<&Proposal> {
        draft.validate(&self.params)?;
        if creator_balance < self.params.min_proposal_balance {
            return Err(LedgerError::InsufficientBalance {
                address: creator.to_string(),
                available: creator_balance,
                required: self.params.min_proposal_balance,
            });
        }
        if self.get_proposal(&id).is_some() {
            return Err(LedgerError::InvalidProposal(format!("proposal {} already exists", id)));
        }

        self.proposals.push(Proposal::new(id, creator.to_string(), draft, now, height));
        let created = &self.proposals[self.proposals.len() - 1];
        tracing::debug!(
            "📋 Proposal {} opened by {} ({}, {}, {}s, {}%)",
            &created.id[..8.min(created.id.len())],
            created.creator,
            created.proposal_type.as_str(),
            created.voting_type.as_str(),
            created.duration,
            created.threshold
        );
        Ok(created)
    }

    pub fn get_proposal(&self, id: &str) -> Option<&Proposal> {
        self.proposals.iter().find(|p| p.id == id)
    }

    fn get_proposal_mut(&mut self, id: &str) -> Option<&mut Proposal> {
        self.proposals.iter_mut().find(|p| p.id == id)
    }

    /// Cast a vote weighted from `basis` (own balance plus delegated).
    /// Returns the proposal status after the vote.
    #[allow(clippy::too_many_arguments)]
    pub fn cast_vote(
        &mut self,
        proposal_id: &str,
        voter: &str,
        choice: VoteChoice,
        basis: impl Into<VoteBasis>,
        now: u64,
        electorate: &dyn ElectorateSource,
        tx_hash: H256,
    ) -> LedgerResult<ProposalStatus> {
        if let Some(delegate) = self.delegations.active_delegate(voter, now) {
            return Err(LedgerError::Unauthorized(format!(
                "{} has delegated its voting power to {}",
                voter, delegate
            )));
        }

        let basis = basis.into();
        let params = self.params.clone();
        let proposal = self
            .get_proposal_mut(proposal_id)
            .ok_or_else(|| LedgerError::NotFound(format!("proposal {}", proposal_id)))?;

        // A delegate already voted with this voter's power
        if !proposal.votes.contains_key(voter) && proposal.power_used_by(voter) {
            return Err(LedgerError::DuplicateVote {
                proposal_id: proposal_id.to_string(),
                voter: voter.to_string(),
            });
        }

        let weight = proposal.voting_type.weight(basis.balance);
        if weight == 0 {
            return Err(LedgerError::InsufficientBalance {
                address: voter.to_string(),
                available: basis.balance,
                required: 1,
            });
        }

        let status = proposal.add_vote(
            Vote {
                voter: voter.to_string(),
                choice,
                weight,
                timestamp: now,
                tx_hash,
                delegators: basis.delegators,
            },
            now,
            electorate,
            &params,
        )?;
        tracing::debug!(
            "🗳️ {} voted {} on {} with weight {} → {:?}",
            voter,
            choice.as_str(),
            &proposal_id[..8.min(proposal_id.len())],
            weight,
            status
        );
        Ok(status)
    }

    /// Check that a treasury payout of `amount` to `recipient` is backed by a
    /// passed, unfunded treasury proposal, and mark it funded by `tx_hash`.
    pub fn authorize_treasury_debit(
        &mut self,
        proposal_id: &str,
        recipient: &str,
        amount: u64,
        now: u64,
        electorate: &dyn ElectorateSource,
        tx_hash: H256,
    ) -> LedgerResult<()> {
        let params = self.params.clone();
        let proposal = self
            .get_proposal_mut(proposal_id)
            .ok_or_else(|| LedgerError::NotFound(format!("proposal {}", proposal_id)))?;

        if proposal.proposal_type != ProposalType::Treasury {
            return Err(LedgerError::InvalidProposal(format!(
                "proposal {} is a {} proposal, not a treasury proposal",
                proposal_id,
                proposal.proposal_type.as_str()
            )));
        }
        let status = evaluate_status(proposal, now, electorate, &params);
        if status != ProposalStatus::Passed {
            return Err(LedgerError::InvalidProposal(format!(
                "proposal {} has not passed (status {:?})",
                proposal_id, status
            )));
        }
        if let Some(prior) = proposal.funded_by {
            return Err(LedgerError::InvalidProposal(format!(
                "proposal {} was already funded by {}",
                proposal_id, prior
            )));
        }
        match &proposal.funding {
            Some(funding) if funding.recipient == recipient && funding.amount == amount => {}
            Some(funding) => {
                return Err(LedgerError::InvalidProposal(format!(
                    "proposal {} funds {} to {}, not {} to {}",
                    proposal_id, funding.amount, funding.recipient, amount, recipient
                )));
            }
            None => {
                return Err(LedgerError::InvalidProposal(format!(
                    "proposal {} requests no funding",
                    proposal_id
                )));
            }
        }

        proposal.status = status;
        proposal.funded_by = Some(tx_hash);
        Ok(())
    }

    /// Lend `delegator`'s voting power to `delegate` for `duration` seconds
    #[allow(clippy::too_many_arguments)]
    pub fn delegate(
        &mut self,
        delegator: &str,
        delegate: &str,
        duration: u64,
        delegator_balance: u64,
        delegate_known: bool,
        now: u64,
        tx_hash: H256,
    ) -> LedgerResult<&Delegation> {
        let invalid = |msg: String| Err(LedgerError::InvalidDelegation(msg));

        if delegator == delegate {
            return invalid("cannot delegate to self".to_string());
        }
        if delegate == TREASURY_ADDRESS || delegate == GENESIS_ADDRESS {
            return invalid(format!("{} cannot receive delegations", delegate));
        }
        if !delegate_known {
            return invalid(format!("delegate {} has never held tokens", delegate));
        }
        if duration == 0 || duration > MAX_DELEGATION_SECS {
            return invalid(format!("duration must be 1-{} seconds", MAX_DELEGATION_SECS));
        }
        if delegator_balance == 0 {
            return Err(LedgerError::InsufficientBalance {
                address: delegator.to_string(),
                available: 0,
                required: 1,
            });
        }
        if let Some(current) = self.delegations.active_delegate(delegator, now) {
            return invalid(format!("{} already delegates to {}", delegator, current));
        }
        if self.delegations.delegators_of(delegator, now).next().is_some() {
            return invalid(format!("{} holds delegated power and cannot pass it on", delegator));
        }
        if let Some(onward) = self.delegations.active_delegate(delegate, now) {
            return invalid(format!("{} has itself delegated to {}", delegate, onward));
        }

        let delegation = Delegation {
            delegator: delegator.to_string(),
            delegate: delegate.to_string(),
            start_time: now,
            end_time: now.saturating_add(duration),
            revoked_at: None,
            tx_hash,
        };
        tracing::debug!(
            "🤝 {} delegates to {} until {}",
            delegation.delegator,
            delegation.delegate,
            delegation.end_time
        );
        self.delegations.entries.insert(delegator.to_string(), delegation);
        self.delegations
            .get(delegator)
            .ok_or_else(|| LedgerError::NotFound(format!("delegation from {}", delegator)))
    }

    /// End `delegator`'s active delegation at `now`
    pub fn revoke_delegation(&mut self, delegator: &str, now: u64) -> LedgerResult<&Delegation> {
        let delegation = self
            .delegations
            .entries
            .get_mut(delegator)
            .filter(|d| d.is_active_at(now))
            .ok_or_else(|| LedgerError::InvalidDelegation(format!("{} has no active delegation", delegator)))?;
        delegation.revoked_at = Some(now);
        tracing::debug!("✂️ {} revoked delegation to {}", delegator, delegation.delegate);
        Ok(&*delegation)
    }

    /// Materialise statuses: deadline outcomes, plus early closes decided
    /// against the electorate at `now`. Returns the proposals that changed,
    /// with their new status.
    pub fn tick(&mut self, now: u64, electorate: &dyn ElectorateSource) -> Vec<(String, ProposalStatus)> {
        let params = self.params.clone();
        let current = electorate.electorate_at(now);
        let mut changed = Vec::new();
        for proposal in &mut self.proposals {
            let status = settled_status(proposal, now, electorate, &current, &params);
            if status != proposal.status {
                proposal.status = status;
                changed.push((proposal.id.clone(), status));
            }
        }
        changed
    }

    /// How many proposals `tick` would change at `now`
    pub fn pending_changes(&self, now: u64, electorate: &dyn ElectorateSource) -> usize {
        let current = electorate.electorate_at(now);
        self.proposals
            .iter()
            .filter(|p| settled_status(p, now, electorate, &current, &self.params) != p.status)
            .count()
    }

    /// All proposals in creation order, with statuses evaluated at `now`
    pub fn evaluated_proposals(&self, now: u64, electorate: &dyn ElectorateSource) -> Vec<Proposal> {
        self.proposals
            .iter()
            .map(|p| self.evaluated(p, now, electorate))
            .collect()
    }

    /// One proposal with its status evaluated at `now`
    pub fn evaluated_proposal(&self, id: &str, now: u64, electorate: &dyn ElectorateSource) -> LedgerResult<Proposal> {
        self.get_proposal(id)
            .map(|p| self.evaluated(p, now, electorate))
            .ok_or_else(|| LedgerError::NotFound(format!("proposal {}", id)))
    }

    fn evaluated(&self, proposal: &Proposal, now: u64, electorate: &dyn ElectorateSource) -> Proposal {
        let mut copy = proposal.clone();
        copy.status = evaluate_status(proposal, now, electorate, &self.params);
        copy
    }

    /// Number of proposals that have paid out of the treasury
    pub fn funded_count(&self) -> usize {
        self.proposals.iter().filter(|p| p.funded_by.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000;

    fn draft(threshold: u64) -> ProposalDraft {
        ProposalDraft {
            title: "Raise block size".to_string(),
            description: "Double it".to_string(),
            proposal_type: ProposalType::General,
            voting_type: VotingType::Weighted,
            duration: 3600,
            threshold,
            funding: None,
        }
    }

    fn electorate(weighted: u64) -> Electorate {
        Electorate {
            holders: 10,
            weighted,
            quadratic: isqrt(weighted),
        }
    }

    fn open(gov: &mut GovernanceState, id: &str, draft: ProposalDraft) {
        gov.create_proposal(id.to_string(), "creator", draft, 0, NOW, 1).unwrap();
    }

    #[test]
    fn test_proposal_voting() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(66));
        let big = electorate(10_000);

        gov.cast_vote("p1", "v1", VoteChoice::Yes, 1000u64, NOW, &big, H256([1; 32])).unwrap();
        gov.cast_vote("p1", "v2", VoteChoice::Yes, 500u64, NOW, &big, H256([2; 32])).unwrap();
        gov.cast_vote("p1", "v3", VoteChoice::No, 200u64, NOW, &big, H256([3; 32])).unwrap();

        let tally = gov.get_proposal("p1").unwrap().tally();
        assert_eq!((tally.yes, tally.no, tally.cast), (1500, 200, 1700));
        assert!(tally.threshold_met); // 88%

        // Not decisive against the electorate, so still open until the deadline
        let p = gov.evaluated_proposal("p1", NOW + 10, &big).unwrap();
        assert_eq!(p.status, ProposalStatus::Open);
        let p = gov.evaluated_proposal("p1", NOW + 3600, &big).unwrap();
        assert_eq!(p.status, ProposalStatus::Passed);
    }

    #[test]
    fn test_duplicate_vote_rejected_and_tally_unchanged() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        let e = electorate(10_000);

        gov.cast_vote("p1", "alice", VoteChoice::Yes, 300u64, NOW, &e, H256([1; 32])).unwrap();
        let before = gov.get_proposal("p1").unwrap().tally();

        let err = gov
            .cast_vote("p1", "alice", VoteChoice::No, 900u64, NOW + 1, &e, H256([2; 32]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVote { .. }));
        assert_eq!(gov.get_proposal("p1").unwrap().tally(), before);
    }

    #[test]
    fn test_tie_rejects_after_deadline() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        let e = electorate(10_000);

        gov.cast_vote("p1", "a", VoteChoice::Yes, 100u64, NOW, &e, H256([1; 32])).unwrap();
        gov.cast_vote("p1", "b", VoteChoice::No, 100u64, NOW, &e, H256([2; 32])).unwrap();

        assert_eq!(
            gov.evaluated_proposal("p1", NOW + 3599, &e).unwrap().status,
            ProposalStatus::Open
        );
        assert_eq!(
            gov.evaluated_proposal("p1", NOW + 3600, &e).unwrap().status,
            ProposalStatus::Rejected
        );
    }

    #[test]
    fn test_no_votes_expires() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        let changed = gov.tick(NOW + 7200, &electorate(100));
        assert_eq!(changed, vec![("p1".to_string(), ProposalStatus::Expired)]);
        // Terminal statuses stick
        assert!(gov.tick(NOW + 9999, &electorate(100)).is_empty());
    }

    #[test]
    fn test_quorum_unmet_expires() {
        let mut gov = GovernanceState::with_params(GovernanceParams {
            quorum_percent: 20,
            ..GovernanceParams::default()
        });
        open(&mut gov, "p1", draft(50));
        let e = electorate(10_000);
        gov.cast_vote("p1", "a", VoteChoice::Yes, 1_000u64, NOW, &e, H256([1; 32])).unwrap();

        let status = gov.evaluated_proposal("p1", NOW + 3600, &e).unwrap().status;
        assert_eq!(status, ProposalStatus::Expired);
    }

    #[test]
    fn test_decisive_majority_closes_early() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(60));
        let e = electorate(1_000);

        let status = gov.cast_vote("p1", "whale", VoteChoice::Yes, 700u64, NOW, &e, H256([1; 32])).unwrap();
        assert_eq!(status, ProposalStatus::Passed);

        let err = gov
            .cast_vote("p1", "late", VoteChoice::No, 10u64, NOW + 1, &e, H256([2; 32]))
            .unwrap_err();
        assert_eq!(err, LedgerError::ProposalClosed("p1".to_string()));
    }

    #[test]
    fn test_vote_after_deadline_is_closed() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        let err = gov
            .cast_vote("p1", "a", VoteChoice::Yes, 10u64, NOW + 3600, &electorate(10_000), H256([1; 32]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::ProposalClosed(_)));
    }

    #[test]
    fn test_zero_balance_cannot_vote() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        let err = gov
            .cast_vote("p1", "broke", VoteChoice::Yes, 0u64, NOW, &electorate(100), H256([1; 32]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_draft_validation() {
        let params = GovernanceParams::default();
        assert!(draft(50).validate(&params).is_ok());

        let mut bad = draft(50);
        bad.title = "  ".to_string();
        assert!(matches!(bad.validate(&params), Err(LedgerError::InvalidProposal(_))));

        let mut bad = draft(101);
        assert!(bad.validate(&params).is_err());
        bad.threshold = 100;
        bad.duration = 0;
        assert!(bad.validate(&params).is_err());

        let mut treasury = draft(50);
        treasury.proposal_type = ProposalType::Treasury;
        assert!(treasury.validate(&params).is_err());
        treasury.funding = Some(Funding {
            recipient: "grantee".to_string(),
            amount: 500,
        });
        assert!(treasury.validate(&params).is_ok());

        let mut general = draft(50);
        general.funding = treasury.funding.clone();
        assert!(general.validate(&params).is_err());
    }

    #[test]
    fn test_min_proposal_balance() {
        let mut gov = GovernanceState::with_params(GovernanceParams {
            min_proposal_balance: 1_000,
            ..GovernanceParams::default()
        });
        let err = gov
            .create_proposal("p1".to_string(), "small", draft(50), 999, NOW, 1)
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { required: 1_000, .. }));
        assert!(gov.create_proposal("p1".to_string(), "big", draft(50), 1_000, NOW, 1).is_ok());
    }

    #[test]
    fn test_treasury_debit_needs_passed_matching_proposal() {
        let mut gov = GovernanceState::default();
        let mut d = draft(50);
        d.proposal_type = ProposalType::Treasury;
        d.funding = Some(Funding {
            recipient: "grantee".to_string(),
            amount: 500,
        });
        open(&mut gov, "grant", d);
        let e = electorate(10_000);

        let err = gov
            .authorize_treasury_debit("grant", "grantee", 500, NOW, &e, H256([9; 32]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidProposal(_)));

        gov.cast_vote("grant", "a", VoteChoice::Yes, 100u64, NOW, &e, H256([1; 32])).unwrap();
        let after = NOW + 3600;

        assert!(gov
            .authorize_treasury_debit("grant", "someone_else", 500, after, &e, H256([9; 32]))
            .is_err());
        gov.authorize_treasury_debit("grant", "grantee", 500, after, &e, H256([9; 32]))
            .unwrap();
        assert_eq!(gov.funded_count(), 1);

        // A passed proposal pays out once
        assert!(gov
            .authorize_treasury_debit("grant", "grantee", 500, after, &e, H256([8; 32]))
            .is_err());
    }

    #[test]
    fn test_token_based_alias() {
        let vt: VotingType = serde_json::from_str("\"token-based\"").unwrap();
        assert_eq!(vt, VotingType::Weighted);
        assert_eq!(serde_json::to_string(&vt).unwrap(), "\"weighted\"");
    }

    #[test]
    fn test_voting_type_weights() {
        assert_eq!(VotingType::Simple.weight(5_000), 1);
        assert_eq!(VotingType::Weighted.weight(5_000), 5_000);
        assert_eq!(VotingType::Quadratic.weight(10_000), 100);
        assert_eq!(VotingType::Quadratic.weight(99), 9);
        assert_eq!(isqrt(u64::MAX), 4_294_967_295);
        assert_eq!(isqrt(u64::MAX - 1), 4_294_967_295);
        assert_eq!(isqrt(4_294_967_295 * 4_294_967_295), 4_294_967_295);
        assert_eq!(isqrt(4_294_967_295 * 4_294_967_295 - 1), 4_294_967_294);
        assert_eq!(VotingType::Quadratic.weight(u64::MAX), 4_294_967_295);
    }

    /// Electorate that changes size at `at`
    struct Shifting {
        at: u64,
        before: Electorate,
        after: Electorate,
    }

    impl ElectorateSource for Shifting {
        fn electorate_at(&self, at: u64) -> Electorate {
            if at < self.at {
                self.before
            } else {
                self.after
            }
        }
    }

    #[test]
    fn test_outcome_fixed_by_electorate_at_deadline() {
        let mut gov = GovernanceState::with_params(GovernanceParams {
            quorum_percent: 10,
            ..GovernanceParams::default()
        });
        open(&mut gov, "p1", draft(50));
        let e = electorate(10_000);
        gov.cast_vote("p1", "a", VoteChoice::Yes, 1_000u64, NOW, &e, H256([1; 32])).unwrap();

        // The electorate doubles one second after the deadline
        let shifting = Shifting {
            at: NOW + 3601,
            before: e,
            after: electorate(20_000),
        };
        for later in [NOW + 3600, NOW + 3601, NOW + 99_999] {
            let status = gov.evaluated_proposal("p1", later, &shifting).unwrap().status;
            assert_eq!(status, ProposalStatus::Passed);
        }

        assert_eq!(gov.pending_changes(NOW + 5000, &shifting), 1);
        gov.tick(NOW + 5000, &shifting);
        assert_eq!(gov.pending_changes(NOW + 5000, &shifting), 0);
        // Once recorded, no electorate can move it
        let huge = electorate(u64::MAX);
        assert_eq!(
            gov.evaluated_proposal("p1", NOW + 6000, &huge).unwrap().status,
            ProposalStatus::Passed
        );
    }

    #[test]
    fn test_early_close_materialised_by_tick() {
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        gov.cast_vote("p1", "a", VoteChoice::Yes, 600u64, NOW, &electorate(10_000), H256([1; 32]))
            .unwrap();

        // Reads before the deadline report what has been recorded
        let shrunk = electorate(1_000);
        assert_eq!(
            gov.evaluated_proposal("p1", NOW + 1, &shrunk).unwrap().status,
            ProposalStatus::Open
        );
        let changed = gov.tick(NOW + 1, &shrunk);
        assert_eq!(changed, vec![("p1".to_string(), ProposalStatus::Passed)]);
    }

    #[test]
    fn test_normalize_proposal_id() {
        let id = "ab".repeat(32);
        assert_eq!(normalize_proposal_id(&id).unwrap(), id);
        assert_eq!(normalize_proposal_id(&format!("0x{}", id.to_uppercase())).unwrap(), id);
        assert!(normalize_proposal_id("abc").is_err());
    }

    fn holders() -> TokenLedger {
        let mut ledger = TokenLedger::new();
        ledger.mint("alice", 100).unwrap();
        ledger.mint("bob", 400).unwrap();
        ledger.mint("carol", 500).unwrap();
        ledger
    }

    #[test]
    fn test_delegation_rules() {
        let mut gov = GovernanceState::default();
        let h = H256([7; 32]);

        let self_loop = gov.delegate("alice", "alice", 100, 100, true, NOW, h).unwrap_err();
        assert!(matches!(self_loop, LedgerError::InvalidDelegation(_)));
        assert!(gov.delegate("alice", TREASURY_ADDRESS, 100, 100, true, NOW, h).is_err());
        assert!(gov.delegate("alice", "nobody", 100, 100, false, NOW, h).is_err());
        assert!(gov.delegate("alice", "bob", 0, 100, true, NOW, h).is_err());
        assert!(gov
            .delegate("alice", "bob", MAX_DELEGATION_SECS + 1, 100, true, NOW, h)
            .is_err());
        assert!(matches!(
            gov.delegate("alice", "bob", 100, 0, true, NOW, h),
            Err(LedgerError::InsufficientBalance { .. })
        ));

        let d = gov.delegate("alice", "bob", 100, 100, true, NOW, h).unwrap();
        assert_eq!((d.start_time, d.end_time), (NOW, NOW + 100));

        // One hop only, one active delegation per delegator
        assert!(gov.delegate("alice", "carol", 100, 100, true, NOW + 1, h).is_err());
        assert!(gov.delegate("bob", "carol", 100, 400, true, NOW + 1, h).is_err());
        assert!(gov.delegate("carol", "alice", 100, 500, true, NOW + 1, h).is_err());

        let revoked = gov.revoke_delegation("alice", NOW + 10).unwrap();
        assert_eq!(revoked.revoked_at, Some(NOW + 10));
        assert!(!revoked.is_active_at(NOW + 10));
        assert!(gov.revoke_delegation("alice", NOW + 11).is_err());

        // Free to delegate again once revoked
        assert!(gov.delegate("alice", "carol", 100, 100, true, NOW + 20, h).is_ok());
        assert!(gov.delegations.get("alice").unwrap().is_active_at(NOW + 119));
        assert!(!gov.delegations.get("alice").unwrap().is_active_at(NOW + 120));
    }

    #[test]
    fn test_voting_power_follows_delegations() {
        let ledger = holders();
        let mut gov = GovernanceState::default();
        gov.delegate("alice", "bob", 100, 100, true, NOW, H256([7; 32])).unwrap();
        let power = VotingPower::new(&ledger, &gov.delegations);

        assert_eq!(power.own("alice", NOW), 0);
        assert_eq!(power.effective_balance("bob", NOW), 500);
        assert_eq!(power.delegated("bob", NOW), 100);
        // Expired
        assert_eq!(power.effective_balance("alice", NOW + 100), 100);
        assert_eq!(power.effective_balance("bob", NOW + 100), 400);

        let during = power.electorate_at(NOW);
        assert_eq!((during.holders, during.weighted), (2, 1_000));
        assert_eq!(during.quadratic, isqrt(500) + isqrt(500));
        let after = power.electorate_at(NOW + 100);
        assert_eq!((after.holders, after.weighted), (3, 1_000));
    }

    #[test]
    fn test_delegated_power_is_not_counted_twice() {
        let ledger = holders();
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        open(&mut gov, "p2", draft(50));
        gov.delegate("alice", "bob", 1000, 100, true, NOW, H256([7; 32])).unwrap();

        // The delegator cannot vote while its power is lent out
        let e = electorate(10_000);
        let err = gov
            .cast_vote("p1", "alice", VoteChoice::No, 100u64, NOW, &e, H256([1; 32]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(_)));

        let basis = VotingPower::new(&ledger, &gov.delegations).vote_balance("bob", NOW, gov.get_proposal("p1").unwrap());
        assert_eq!(basis.balance, 500);
        assert_eq!(basis.delegators, vec!["alice".to_string()]);
        gov.cast_vote("p1", "bob", VoteChoice::Yes, basis, NOW, &e, H256([2; 32])).unwrap();

        // Revoking does not hand back power the delegate already used
        gov.revoke_delegation("alice", NOW + 1).unwrap();
        let err = gov
            .cast_vote("p1", "alice", VoteChoice::No, 100u64, NOW + 2, &e, H256([3; 32]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVote { .. }));
        // but it may vote on a proposal the delegate left alone
        gov.cast_vote("p2", "alice", VoteChoice::No, 100u64, NOW + 2, &e, H256([4; 32])).unwrap();
        assert_eq!(gov.get_proposal("p1").unwrap().tally().yes, 500);
    }

    #[test]
    fn test_delegate_skips_delegators_who_voted_first() {
        let ledger = holders();
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        let e = electorate(10_000);
        gov.cast_vote("p1", "alice", VoteChoice::No, 100u64, NOW, &e, H256([1; 32])).unwrap();
        gov.delegate("alice", "bob", 1000, 100, true, NOW + 1, H256([7; 32])).unwrap();

        let power = VotingPower::new(&ledger, &gov.delegations);
        assert_eq!(power.effective_balance("bob", NOW + 2), 500);
        assert_eq!(power.vote_balance("bob", NOW + 2, gov.get_proposal("p1").unwrap()).balance, 400);
    }

    #[test]
    fn test_power_used_once_across_redelegation() {
        let ledger = holders();
        let mut gov = GovernanceState::default();
        open(&mut gov, "p1", draft(50));
        let e = electorate(10_000);

        gov.delegate("alice", "bob", 1000, 100, true, NOW, H256([7; 32])).unwrap();
        let basis = VotingPower::new(&ledger, &gov.delegations).vote_balance("bob", NOW, gov.get_proposal("p1").unwrap());
        gov.cast_vote("p1", "bob", VoteChoice::Yes, basis, NOW, &e, H256([1; 32])).unwrap();

        gov.revoke_delegation("alice", NOW + 1).unwrap();
        gov.delegate("alice", "carol", 1000, 100, true, NOW + 2, H256([8; 32])).unwrap();
        let basis = VotingPower::new(&ledger, &gov.delegations).vote_balance("carol", NOW + 3, gov.get_proposal("p1").unwrap());
        assert_eq!(basis, VoteBasis::from(500));

        gov.revoke_delegation("alice", NOW + 4).unwrap();
        let err = gov
            .cast_vote("p1", "alice", VoteChoice::No, 100u64, NOW + 5, &e, H256([2; 32]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVote { .. }));
        assert!(gov.get_proposal("p1").unwrap().power_used_by("alice"));
    }
}
