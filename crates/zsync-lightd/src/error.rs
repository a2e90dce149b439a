//! Error types for sync operations

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// A call or stream exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Status error
    #[error("Status error: {0}")]
    Status(#[from] tonic::Status),

    /// Retries for a connectivity failure were exhausted
    #[error("Max attempts reached ({attempts}): {last}")]
    MaxAttemptsReached {
        /// Attempts made
        attempts: u32,
        /// Last error message
        last: String,
    },

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Legacy and new cache locations are identical
    #[error("Legacy cache and new cache roots are the same path")]
    CacheMigrationSameUrl,

    /// Legacy cache file could not be deleted
    #[error("Failed to delete legacy cache: {0}")]
    LegacyCacheDeletionFailed(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid local configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Server reports a different network type
    #[error("Network mismatch: expected {expected}, server reports {found}")]
    NetworkMismatch {
        /// Local network
        expected: String,
        /// Server network
        found: String,
    },

    /// Server reports an unknown chain name
    #[error("Unexpected chain name: {0}")]
    UnknownChainName(String),

    /// Server reports a different Sapling activation height
    #[error("Sapling activation mismatch: expected {expected}, server reports {found}")]
    SaplingActivationMismatch {
        /// Local activation height
        expected: u64,
        /// Server activation height
        found: u64,
    },

    /// Server reports a different consensus branch ID
    #[error("Consensus branch ID mismatch: expected {expected}, server reports {found}")]
    ConsensusBranchIdMismatch {
        /// Local branch ID (hex)
        expected: String,
        /// Server branch ID (hex)
        found: String,
    },

    /// Server sent a branch ID that does not parse
    #[error("Invalid consensus branch ID from server: {0}")]
    InvalidConsensusBranchId(String),

    /// Chain discontinuity detected at the given height
    #[error("Invalid chain at height {0}")]
    InvalidChain(u64),

    /// Scan was requested without a known scanned height
    #[error("Latest scanned height is unknown")]
    MissingScannedHeight,

    /// Rewind could not be applied
    #[error("Rewind failed: {0}")]
    RewindFailed(String),

    /// Scanning engine failure
    #[error("Scanning engine error: {0}")]
    Engine(String),

    /// Sapling parameter files are missing or corrupt
    #[error("Sapling parameters error: {0}")]
    SaplingParams(String),

    /// Broken internal invariant
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Classification that drives retry and failure handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid local setup; fatal
    Configuration,
    /// Transient network trouble; retried with backoff
    Connectivity,
    /// Server and wallet disagree on the chain; fatal
    Consistency,
    /// Chain discontinuity; handled by rewinding
    Reorg,
    /// Broken internal assumption; fatal
    Invariant,
    /// Cooperative stop
    Cancelled,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_)
            | Error::Connection(_)
            | Error::Timeout(_)
            | Error::Transport(_)
            | Error::Status(_) => ErrorKind::Connectivity,
            Error::MaxAttemptsReached { .. } => ErrorKind::Connectivity,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::CacheMigrationSameUrl
            | Error::LegacyCacheDeletionFailed(_)
            | Error::Storage(_)
            | Error::Io(_)
            | Error::Configuration(_)
            | Error::SaplingParams(_) => ErrorKind::Configuration,
            Error::NetworkMismatch { .. }
            | Error::UnknownChainName(_)
            | Error::SaplingActivationMismatch { .. }
            | Error::ConsensusBranchIdMismatch { .. } => ErrorKind::Consistency,
            Error::InvalidChain(_) => ErrorKind::Reorg,
            Error::InvalidConsensusBranchId(_)
            | Error::MissingScannedHeight
            | Error::RewindFailed(_)
            | Error::Engine(_)
            | Error::Invariant(_) => ErrorKind::Invariant,
        }
    }

    /// Whether the orchestrator may retry the failed action
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity && !matches!(self, Error::MaxAttemptsReached { .. })
    }

    /// Whether a gRPC status indicates the server timed out
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Status(status) => status.code() == tonic::Code::DeadlineExceeded,
            _ => false,
        }
    }
}

impl From<zsync_storage_sqlite::Error> for Error {
    fn from(e: zsync_storage_sqlite::Error) -> Self {
        Error::Storage(format!("{}", e))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}
