use thiserror::Error;

/// Unified error type for the node core.
///
/// Transaction- and block-level variants are rejections, not failures: they
/// surface to the submitter (and to P2P, which scores the sender) and the
/// node keeps running. `StoreCorruption` is fatal and bubbles to shutdown.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    // Decoding
    #[error("malformed data: {0}")]
    Malformed(String),

    // Transaction-level rejections
    #[error("invalid signature")]
    InvalidSignature,

    #[error("signing key already used by this account")]
    ReusedSigningKey,

    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("nonce gap: expected {expected}, got {got}")]
    NonceGap { expected: u64, got: u64 },

    #[error("duplicate transaction")]
    DuplicateTx,

    #[error("unknown token")]
    UnknownToken,

    #[error("multi-sig threshold not met")]
    ThresholdNotMet,

    #[error("expired at block {expiry}, tip is {tip}")]
    Expired { expiry: u64, tip: u64 },

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("fee below mempool admission floor: minimum {minimum}, got {got}")]
    FeeTooLow { minimum: u64, got: u64 },

    #[error("mempool full")]
    MempoolFull,

    // Block-level rejections
    #[error("proof of work does not meet target")]
    BadPoW,

    #[error("merkle root mismatch")]
    BadMerkleRoot,

    #[error("bad timestamp: {0}")]
    BadTimestamp(String),

    #[error("bad height: expected {expected}, got {got}")]
    BadHeight { expected: u64, got: u64 },

    #[error("unknown parent block")]
    UnknownParent,

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("block extends a branch marked invalid")]
    InvalidBranch,

    // Chain-level
    #[error("reorg depth {depth} exceeds limit {limit}")]
    ReorgTooDeep { depth: u64, limit: u64 },

    #[error("block not found")]
    BlockNotFound,

    // Storage (fatal)
    #[error("storage corruption: {0}")]
    StoreCorruption(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Peer / protocol
    #[error("peer timed out")]
    PeerTimeout,

    #[error("peer exceeded declared rate limit")]
    PeerRateExceeded,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("network error: {0}")]
    Network(String),

    // Ambient
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cryptography error: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("task join error: {0}")]
    TaskJoin(String),
}

impl CoreError {
    /// Rejections that justify scoring down (and eventually banning) the
    /// peer that relayed the offending bytes.
    pub fn is_bannable(&self) -> bool {
        matches!(
            self,
            CoreError::Malformed(_)
                | CoreError::ProtocolViolation(_)
                | CoreError::PeerRateExceeded
                | CoreError::BadPoW
                | CoreError::BadMerkleRoot
        )
    }

    /// Fatal errors that must stop the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::StoreCorruption(_))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => CoreError::StoreCorruption(err.to_string()),
            other => CoreError::Storage(other.to_string()),
        }
    }
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        CoreError::Malformed(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CoreError::TaskJoin(err.to_string())
    }
}
