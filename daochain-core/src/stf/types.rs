//! Primitive types shared across the state machine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::error::{LedgerError, LedgerResult};

/// Reserved ledger account holding the DAO treasury.
pub const TREASURY_ADDRESS: &str = "treasury";

/// Sender of the genesis mint transactions.
pub const GENESIS_ADDRESS: &str = "genesis";

const MAX_ADDRESS_LEN: usize = 128;

/// 32-byte SHA-256 digest identifying a block or transaction.
/// Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct H256(pub [u8; 32]);

impl H256 {
    pub const ZERO: H256 = H256([0u8; 32]);

    /// Hex length of a digest, without any `0x` prefix
    pub const HEX_LEN: usize = 64;

    pub fn from_hex(s: &str) -> LedgerResult<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != Self::HEX_LEN {
            return Err(LedgerError::InvalidFormat(format!(
                "digest must be {} hex characters, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| LedgerError::InvalidFormat(format!("digest is not hex: {}", e)))?;
        Ok(H256(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<Sha256> for H256 {
    fn from(hasher: Sha256) -> Self {
        H256(hasher.finalize().into())
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256({})", self.short())
    }
}

impl Serialize for H256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        H256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Length-prefixed string update so adjacent fields cannot alias.
pub(crate) fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

/// Key accepted by block lookups: a digest or a decimal height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKey {
    ByHash(H256),
    ByHeight(u64),
}

impl FromStr for LookupKey {
    type Err = LedgerError;

    /// A `0x`-prefixed or 64-character hex string is a digest; any other
    /// all-digit string is a height. Everything else is malformed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("0x") || s.len() == H256::HEX_LEN {
            return H256::from_hex(s).map(LookupKey::ByHash);
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::InvalidFormat(format!(
                "'{}' is neither a block hash nor a height",
                s
            )));
        }
        s.parse::<u64>()
            .map(LookupKey::ByHeight)
            .map_err(|_| LedgerError::InvalidFormat(format!("height '{}' out of range", s)))
    }
}

/// Addresses are opaque account identifiers: 1..=128 characters of
/// `[A-Za-z0-9_-]`.
pub fn validate_address(address: &str) -> LedgerResult<()> {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN {
        return Err(LedgerError::InvalidFormat(format!(
            "address must be 1-{} characters",
            MAX_ADDRESS_LEN
        )));
    }
    if !address
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(LedgerError::InvalidFormat(format!(
            "address '{}' contains invalid characters",
            address
        )));
    }
    Ok(())
}

/// Wall-clock source for proposal deadlines, in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Hand-driven clock for deadline tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock(std::sync::atomic::AtomicU64);

#[cfg(test)]
impl ManualClock {
    pub fn at(secs: u64) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self(std::sync::atomic::AtomicU64::new(secs)))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
