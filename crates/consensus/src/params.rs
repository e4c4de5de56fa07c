//! Consensus parameter definitions.

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Mainnet),
            "test" | "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "main",
            Self::Testnet => "test",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub subsidy_halving_interval: i32,
    /// Highest target (easiest difficulty) a header may claim.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub genesis_time: u32,
    pub genesis_nonce: u32,
    pub genesis_bits: u32,
    pub genesis_version: i32,
    pub genesis_reward: Amount,
    /// Run the full mempool consistency check after every change by default.
    pub default_consistency_checks: bool,
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a big-endian display hex string into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Renders a hash in display (big-endian) order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    hash.iter().rev().map(|byte| format!("{byte:02x}")).collect()
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

fn limit(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0xff; 32])
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        subsidy_halving_interval: 840_000,
        pow_limit: limit("00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_spacing: 150,
        pow_target_timespan: 302_400,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        genesis_time: 1_317_972_665,
        genesis_nonce: 2_084_524_493,
        genesis_bits: 0x1e0f_fff0,
        genesis_version: 1,
        genesis_reward: 50 * COIN,
        default_consistency_checks: false,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        genesis_time: 1_486_949_366,
        genesis_nonce: 293_345,
        pow_allow_min_difficulty_blocks: true,
        ..mainnet_consensus_params()
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        subsidy_halving_interval: 150,
        pow_limit: limit("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        genesis_time: 1_296_688_602,
        genesis_nonce: 0,
        genesis_bits: 0x207f_ffff,
        default_consistency_checks: true,
        ..mainnet_consensus_params()
    }
}
