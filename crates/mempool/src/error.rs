use ledgerd_chainstate::{CoinsError, ValidationError};
use ledgerd_primitives::encoding::DecodeError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    ConflictingInput,
    InsufficientFee,
    MissingInputs,
    MempoolFull,
    TooLongMempoolChain,
    NonFinal,
    PrematureCoinbaseSpend,
    InvalidTransaction,
    InvalidScript,
    ReplacementRejected,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(MempoolErrorKind::Internal, message)
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

impl From<CoinsError> for MempoolError {
    fn from(err: CoinsError) -> Self {
        Self::internal(format!("coin view: {err}"))
    }
}

impl From<ValidationError> for MempoolError {
    fn from(err: ValidationError) -> Self {
        let kind = match &err {
            ValidationError::MissingInputs => MempoolErrorKind::MissingInputs,
            ValidationError::PrematureCoinbaseSpend => MempoolErrorKind::PrematureCoinbaseSpend,
            ValidationError::Script(_) => MempoolErrorKind::InvalidScript,
            ValidationError::Coins(_) => MempoolErrorKind::Internal,
            _ => MempoolErrorKind::InvalidTransaction,
        };
        Self::new(kind, err.to_string())
    }
}

/// Failure reading or writing the mempool dump file.
#[derive(Debug)]
pub enum PersistError {
    Io(std::io::Error),
    Decode(DecodeError),
    UnsupportedVersion(u64),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "mempool file io: {err}"),
            Self::Decode(err) => write!(f, "invalid mempool file: {err}"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported mempool file version {version}")
            }
        }
    }
}

impl std::error::Error for PersistError {}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DecodeError> for PersistError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}
