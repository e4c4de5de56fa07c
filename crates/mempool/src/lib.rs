//! Pool of unconfirmed transactions with package-aware ordering, eviction,
//! opt-in replacement and on-disk snapshots.

pub mod accept;
pub mod entry;
pub mod error;
pub mod persist;
pub mod policy;
pub mod pool;
pub mod rbf;
pub mod view;

pub use accept::{accept_to_memory_pool, AcceptContext, AcceptOutcome};
pub use entry::{LockPoints, MempoolEntry, MEMPOOL_HEIGHT};
pub use error::{MempoolError, MempoolErrorKind, PersistError};
pub use persist::{LoadStats, MempoolDump, MempoolLoader};
pub use policy::{FeeRate, MempoolLimits, MempoolPolicy};
pub use pool::{
    AncestorSet, Mempool, RemovalReason, TxMempoolInfo, MAX_ITERATIONS_PER_TRIM,
    PACKAGE_ANCESTOR_THRESHOLD,
};
pub use rbf::{check_replacement, find_conflicts, is_rbf_opt_in, RbfState, ReplacementPlan};
pub use view::MempoolCoinsView;
