//! Difficulty and compact target utilities.

use ledgerd_consensus::Hash256;
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let word = bits & 0x007f_ffff;

    if word != 0 && (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }

    if size <= 3 {
        return Ok(U256::from(word >> (8 * (3 - size))));
    }

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
        return Ok(U256::from(word) << (8 * (size - 3)) as usize);
    }
    Ok(U256::zero())
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(u256_to_hash(value))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected number of hashes needed to meet `bits`: `2^256 / (target + 1)`,
/// computed as `~target / (target + 1) + 1` to stay inside 256 bits.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Adds `proof` to `work`, failing instead of wrapping.
pub fn add_work(work: U256, proof: U256) -> Option<U256> {
    work.checked_add(proof)
}

fn u256_to_hash(value: U256) -> Hash256 {
    value.to_little_endian()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn easiest_regtest_target_proof_is_two() {
        assert_eq!(block_proof(0x207fffff).expect("proof"), U256::from(2u64));
    }

    #[test]
    fn proof_grows_as_target_shrinks() {
        let easy = block_proof(0x1e0ffff0).expect("easy");
        let hard = block_proof(0x1d00ffff).expect("hard");
        assert!(hard > easy);
        assert_eq!(hard, U256::from(0x1_0001_0001u64));
    }

    #[test]
    fn zero_and_negative_targets() {
        assert_eq!(block_proof(0).expect("zero"), U256::zero());
        assert_eq!(compact_to_u256(0x04923456), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff123456), Err(CompactError::Overflow));
    }

    #[test]
    fn add_work_detects_overflow() {
        assert!(add_work(U256::MAX, U256::from(1u64)).is_none());
        assert_eq!(
            add_work(U256::from(3u64), U256::from(4u64)),
            Some(U256::from(7u64))
        );
    }
}
