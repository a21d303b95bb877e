//! Token Ledger
//!
//! Account balances derived from applied transactions. Every mutation checks
//! first and writes second, so a failed call leaves every balance untouched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{LedgerError, LedgerResult};
use super::governance::{Proposal, ProposalStatus};
use super::types::{GENESIS_ADDRESS, TREASURY_ADDRESS};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLedger {
    /// address -> balance; zero balances may be absent
    balances: HashMap<String, u64>,

    /// address -> next expected nonce
    nonces: HashMap<String, u64>,

    total_supply: u64,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance of `address`; unknown addresses hold zero
    pub fn balance_of(&self, address: &str) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn treasury_balance(&self) -> u64 {
        self.balance_of(TREASURY_ADDRESS)
    }

    pub fn total_supply(&self) -> u64 {
        self.total_supply
    }

    pub fn nonce_of(&self, address: &str) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    /// Require `nonce` to be the next one for `address`, then consume it
    pub fn consume_nonce(&mut self, address: &str, nonce: u64) -> LedgerResult<()> {
        let expected = self.nonce_of(address);
        if nonce != expected {
            return Err(LedgerError::InvalidNonce {
                address: address.to_string(),
                expected,
                got: nonce,
            });
        }
        self.nonces.insert(address.to_string(), expected + 1);
        Ok(())
    }

    /// Create `amount` new tokens in `to`. Genesis only; the caller enforces that.
    pub fn mint(&mut self, to: &str, amount: u64) -> LedgerResult<()> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("mint amount must be positive".into()));
        }
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount("total supply overflow".into()))?;
        let credited = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("balance overflow for {}", to)))?;
        self.total_supply = supply;
        self.balances.insert(to.to_string(), credited);
        Ok(())
    }

    /// Debit `from` and credit `to` atomically
    pub fn apply_transfer(&mut self, from: &str, to: &str, amount: u64) -> LedgerResult<()> {
        if from == TREASURY_ADDRESS || to == TREASURY_ADDRESS {
            return Err(LedgerError::Unauthorized(
                "treasury funds move only through a passed treasury proposal".into(),
            ));
        }
        self.move_tokens(from, to, amount)
    }

    /// Debit the treasury for a passed funding proposal
    pub fn apply_treasury_transfer(&mut self, to: &str, amount: u64, proposal: &Proposal) -> LedgerResult<()> {
        if proposal.status != ProposalStatus::Passed {
            return Err(LedgerError::InvalidProposal(format!(
                "proposal {} has not passed",
                proposal.id
            )));
        }
        self.move_tokens(TREASURY_ADDRESS, to, amount)
    }

    fn move_tokens(&mut self, from: &str, to: &str, amount: u64) -> LedgerResult<()> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount("amount must be positive".into()));
        }
        let available = self.balance_of(from);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                address: from.to_string(),
                available,
                required: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let credited = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("balance overflow for {}", to)))?;

        self.balances.insert(from.to_string(), available - amount);
        self.balances.insert(to.to_string(), credited);
        Ok(())
    }

    /// Non-zero balances of voting accounts (everything but treasury and genesis)
    pub fn holdings(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.balances
            .iter()
            .filter(|(address, balance)| {
                **balance > 0 && address.as_str() != TREASURY_ADDRESS && address.as_str() != GENESIS_ADDRESS
            })
            .map(|(address, balance)| (address.as_str(), *balance))
    }

    /// Whether `address` has ever held tokens or sent a transaction
    pub fn is_known(&self, address: &str) -> bool {
        self.balances.contains_key(address) || self.nonces.contains_key(address)
    }

    /// Number of accounts with a non-zero balance
    pub fn holder_count(&self) -> usize {
        self.balances.values().filter(|b| **b > 0).count()
    }

    /// Sum of all balances; equals total supply when the ledger is consistent
    #[cfg(test)]
    pub fn balance_sum(&self) -> u64 {
        self.balances.values().fold(0u64, |acc, b| acc.saturating_add(*b))
    }
}
