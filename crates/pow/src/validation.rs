use ledgerd_consensus::ConsensusParams;
use ledgerd_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "block hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that the header's claimed target is sane for the network and that
/// its hash meets it.
pub fn validate_pow_header(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash_value = U256::from_little_endian(&header.hash());
    if hash_value > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

/// Searches nonces from the current one until the header meets its target.
/// Returns false when `max_tries` nonces were exhausted.
pub fn grind_nonce(
    header: &mut BlockHeader,
    params: &ConsensusParams,
    max_tries: u64,
) -> Result<bool, PowError> {
    for _ in 0..max_tries {
        match validate_pow_header(header, params) {
            Ok(()) => return Ok(true),
            Err(PowError::HashMismatch) => {
                header.nonce = header.nonce.wrapping_add(1);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}
