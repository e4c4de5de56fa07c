//! Compact target arithmetic, per-block work and header proof-of-work checks.
//!
//! Difficulty retargeting is a network policy decided outside this crate;
//! headers are only checked against their own claimed target and the
//! network's limit.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, compact_to_u256, u256_to_compact, CompactError};
pub use validation::{grind_nonce, validate_pow_header, PowError};
