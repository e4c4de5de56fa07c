//! Fee rates, package limits and admission policy knobs.

use std::fmt;

use ledgerd_consensus::money::{Amount, COIN};

pub const DEFAULT_MAX_MEMPOOL_SIZE_MB: usize = 300;
pub const DEFAULT_MEMPOOL_EXPIRY_HOURS: u64 = 336;
pub const DEFAULT_ANCESTOR_LIMIT: u64 = 25;
pub const DEFAULT_ANCESTOR_SIZE_LIMIT_KB: u64 = 101;
pub const DEFAULT_DESCENDANT_LIMIT: u64 = 25;
pub const DEFAULT_DESCENDANT_SIZE_LIMIT_KB: u64 = 101;
pub const DEFAULT_MIN_RELAY_TX_FEE: Amount = 1000;
pub const DEFAULT_INCREMENTAL_RELAY_FEE: Amount = 1000;
pub const DEFAULT_PERSIST_MEMPOOL: bool = true;

/// Largest total fee delta a single transaction can be prioritised by.
pub const MAX_PRIORITISATION_DELTA: Amount = 1000 * COIN;

/// Replacement may evict at most this many entries, descendants included.
pub const MAX_REPLACEMENT_CANDIDATES: usize = 100;

/// Fee rate in satoshis per 1000 bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FeeRate(Amount);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    pub const fn from_sat_per_kb(sat_per_kb: Amount) -> Self {
        Self(sat_per_kb)
    }

    /// Rate paid by `fee` over `size` bytes.
    pub fn new(fee: Amount, size: usize) -> Self {
        if size == 0 {
            return Self(0);
        }
        let size = i128::try_from(size).unwrap_or(i128::MAX);
        let rate = i128::from(fee).saturating_mul(1000) / size;
        Self(clamp_i128(rate))
    }

    pub fn sat_per_kb(self) -> Amount {
        self.0
    }

    /// Fee owed for `size` bytes; never rounds a non-zero rate down to zero.
    pub fn fee(self, size: usize) -> Amount {
        let size_i = i128::try_from(size).unwrap_or(i128::MAX);
        let fee = clamp_i128(i128::from(self.0).saturating_mul(size_i) / 1000);
        if fee == 0 && size != 0 {
            return self.0.signum();
        }
        fee
    }

    pub fn saturating_add(self, other: FeeRate) -> FeeRate {
        FeeRate(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let coin = COIN.unsigned_abs();
        write!(f, "{sign}{}.{:08} per kB", abs / coin, abs % coin)
    }
}

fn clamp_i128(value: i128) -> Amount {
    value.clamp(i128::from(Amount::MIN), i128::from(Amount::MAX)) as Amount
}

/// Package limits applied when computing an entry's in-pool ancestors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MempoolLimits {
    pub ancestor_count: u64,
    pub ancestor_size: u64,
    pub descendant_count: u64,
    pub descendant_size: u64,
}

impl MempoolLimits {
    /// Limits that never reject, package fee floor included; used when
    /// re-linking after a reorg.
    pub fn unlimited() -> Self {
        Self {
            ancestor_count: u64::MAX,
            ancestor_size: u64::MAX,
            descendant_count: u64::MAX,
            descendant_size: u64::MAX,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::unlimited()
    }
}

impl Default for MempoolLimits {
    fn default() -> Self {
        Self {
            ancestor_count: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size: DEFAULT_ANCESTOR_SIZE_LIMIT_KB * 1000,
            descendant_count: DEFAULT_DESCENDANT_LIMIT,
            descendant_size: DEFAULT_DESCENDANT_SIZE_LIMIT_KB * 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MempoolPolicy {
    pub max_mempool_bytes: usize,
    pub expiry_secs: i64,
    pub min_relay_fee: FeeRate,
    pub incremental_relay_fee: FeeRate,
    pub enable_replacement: bool,
    pub persist: bool,
    /// Fraction of mutations followed by a full consistency check.
    pub check_ratio: f64,
    pub limits: MempoolLimits,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self {
            max_mempool_bytes: DEFAULT_MAX_MEMPOOL_SIZE_MB * 1_000_000,
            expiry_secs: (DEFAULT_MEMPOOL_EXPIRY_HOURS * 3600) as i64,
            min_relay_fee: FeeRate::from_sat_per_kb(DEFAULT_MIN_RELAY_TX_FEE),
            incremental_relay_fee: FeeRate::from_sat_per_kb(DEFAULT_INCREMENTAL_RELAY_FEE),
            enable_replacement: false,
            persist: DEFAULT_PERSIST_MEMPOOL,
            check_ratio: 0.0,
            limits: MempoolLimits::default(),
        }
    }
}
