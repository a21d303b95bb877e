//! Node and genesis configuration, loaded from TOML.
//!
//! Every section is optional; missing sections take their defaults, which
//! describe a single-account development chain.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::stf::{
    validate_address, Block, GovernanceParams, Transaction, TxPayload, GENESIS_ADDRESS, TREASURY_ADDRESS,
};

pub const CONFIG_FILE_NAME: &str = "genesis.toml";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Timestamp stamped on the genesis block and its mints
    pub genesis_timestamp: u64,

    /// Write a checkpoint every this many blocks (0 disables periodic checkpoints)
    pub checkpoint_interval: u64,

    /// Sender used by HTTP writes that omit `from`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_sender: Option<String>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            genesis_timestamp: 0,
            checkpoint_interval: 10,
            default_sender: Some("faucet".to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreasuryConfig {
    pub initial_balance: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub address: String,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub governance: GovernanceParams,
    pub treasury: TreasuryConfig,
    pub allocations: Vec<Allocation>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            governance: GovernanceParams::default(),
            treasury: TreasuryConfig {
                initial_balance: 1_000_000,
            },
            allocations: vec![Allocation {
                address: "faucet".to_string(),
                amount: 1_000_000_000,
            }],
        }
    }
}

impl NodeConfig {
    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).with_context(|| format!("failed to read config {:?}", path))?;
        let config: NodeConfig =
            toml::from_str(&contents).with_context(|| format!("failed to parse config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `genesis.toml` from a data dir, or fall back to defaults
    pub fn load_or_default(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = data_dir.as_ref().join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::info!("📄 No {} in {:?}, using development defaults", CONFIG_FILE_NAME, data_dir.as_ref());
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.governance.quorum_percent > 100 {
            anyhow::bail!("governance.quorum_percent {} is not a percentage", self.governance.quorum_percent);
        }
        if self.governance.max_duration_secs == 0 {
            anyhow::bail!("governance.max_duration_secs must be positive");
        }
        if let Some(sender) = &self.chain.default_sender {
            validate_address(sender).context("chain.default_sender")?;
        }
        let mut supply = self.treasury.initial_balance;
        for allocation in &self.allocations {
            validate_address(&allocation.address)
                .with_context(|| format!("allocation address {:?}", allocation.address))?;
            if allocation.address == TREASURY_ADDRESS || allocation.address == GENESIS_ADDRESS {
                anyhow::bail!("allocation to reserved address {:?}", allocation.address);
            }
            if allocation.amount == 0 {
                anyhow::bail!("allocation to {} must be positive", allocation.address);
            }
            supply = supply
                .checked_add(allocation.amount)
                .ok_or_else(|| anyhow::anyhow!("genesis supply overflows u64"))?;
        }
        Ok(())
    }

    /// The height-0 block minting every allocation, then the treasury
    pub fn genesis_block(&self) -> Block {
        let mut mints: Vec<(&str, u64)> = self
            .allocations
            .iter()
            .map(|a| (a.address.as_str(), a.amount))
            .collect();
        if self.treasury.initial_balance > 0 {
            mints.push((TREASURY_ADDRESS, self.treasury.initial_balance));
        }

        let timestamp = self.chain.genesis_timestamp;
        let transactions = mints
            .into_iter()
            .enumerate()
            .map(|(nonce, (to, amount))| {
                Transaction::new(
                    GENESIS_ADDRESS,
                    nonce as u64,
                    timestamp,
                    TxPayload::Mint {
                        to: to.to_string(),
                        amount,
                    },
                )
            })
            .collect();
        Block::genesis(timestamp, transactions)
    }
}
