//! Monetary units, money range rules and the default subsidy schedule.

use crate::params::ConsensusParams;

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in satoshi) is valid.
pub const MAX_MONEY: Amount = 84_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Halving subsidy schedule. Networks with a different reward curve supply
/// their own function to block connection.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    if height < 0 || params.subsidy_halving_interval <= 0 {
        return 0;
    }
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.genesis_reward >> halvings
}
