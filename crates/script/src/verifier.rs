use std::sync::Arc;

use ledgerd_primitives::transaction::{Transaction, TxOut};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;

pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_LOW_S;
pub const BLOCK_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    SigCheck,
    SigEncoding,
    LockTime,
    InputIndexOutOfRange,
    Other(String),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::LockTime => write!(f, "locktime check failed"),
            ScriptError::InputIndexOutOfRange => write!(f, "input index out of range"),
            ScriptError::Other(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Decides whether input `input_index` of `tx` satisfies the spending
/// condition of `spent`.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &TxOut,
        flags: ScriptFlags,
    ) -> Result<(), ScriptError>;
}

impl<F> ScriptVerifier for F
where
    F: Fn(&Transaction, usize, &TxOut, ScriptFlags) -> Result<(), ScriptError> + Send + Sync,
{
    fn verify(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &TxOut,
        flags: ScriptFlags,
    ) -> Result<(), ScriptError> {
        self(tx, input_index, spent, flags)
    }
}

/// Verifier that accepts every spend. Used when script checks are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl ScriptVerifier for AcceptAll {
    fn verify(
        &self,
        tx: &Transaction,
        input_index: usize,
        _spent: &TxOut,
        _flags: ScriptFlags,
    ) -> Result<(), ScriptError> {
        if input_index >= tx.vin.len() {
            return Err(ScriptError::InputIndexOutOfRange);
        }
        Ok(())
    }
}

/// One deferred input check. `tx_index` is the position inside the block.
#[derive(Clone, Debug)]
pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub tx_index: usize,
    pub input_index: usize,
    pub spent: TxOut,
    pub flags: ScriptFlags,
}

impl ScriptCheck {
    pub fn run(&self, verifier: &dyn ScriptVerifier) -> Result<(), ScriptError> {
        verifier.verify(&self.tx, self.input_index, &self.spent, self.flags)
    }
}
