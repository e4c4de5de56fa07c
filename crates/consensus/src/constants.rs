//! Consensus-wide constants shared across validation.

/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// The maximum allowed size for a serialized block, in bytes.
pub const MAX_BLOCK_SERIALIZED_SIZE: usize = 4_000_000;
/// The maximum allowed number of legacy signature operations in a block.
pub const MAX_BLOCK_SIGOPS: usize = 20_000;
/// Smallest serialized transaction accepted by context-free checks.
pub const MIN_TRANSACTION_SIZE: usize = 60;
/// Maximum script size.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Threshold for `lock_time`: below this value it is interpreted as block
/// height, otherwise as a UNIX timestamp.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Input sequence number that disables lock-time for that input.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
/// Inputs with a sequence below this value signal opt-in replacement.
pub const MAX_BIP125_RBF_SEQUENCE: u32 = 0xffff_fffd;

/// Use the median time past instead of the block time for lock-time checks.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_MEDIAN_TIME_PAST;

/// Maximum number of parent hops `find_fork` walks before giving up.
pub const DEFAULT_MAX_FORK_TRAVERSAL: usize = 1000;

/// Number of previous blocks considered for the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Maximum allowed drift of a block timestamp into the future, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
