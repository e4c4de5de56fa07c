//! Script verification seam and batch check queues.
//!
//! The interpreter itself lives outside the engine. Callers plug one in
//! through [`ScriptVerifier`]; block connection fans input checks out through
//! a [`CheckQueue`].

pub mod checkqueue;
pub mod sigops;
pub mod verifier;

pub use checkqueue::{BatchHandle, CheckFailure, CheckQueue, InlineCheckQueue, ParallelCheckQueue};
pub use verifier::{
    AcceptAll, ScriptCheck, ScriptError, ScriptFlags, ScriptVerifier, BLOCK_SCRIPT_VERIFY_FLAGS,
    MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
};
