//! Consensus constants, money rules and per-network parameters.

pub mod constants;
pub mod money;
pub mod params;

pub use params::{consensus_params, hash256_from_hex, hash256_to_hex, ConsensusParams, Network};

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
