use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Rejected by server: {0}")]
    RejectedByServer(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Retry budget exhausted after {attempts} attempts: {reason}")]
    RetryBudgetExhausted { attempts: u32, reason: String },

    #[error("Queue entry {0} not found")]
    EntryNotFound(u64),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Whether the reconciler should retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// Whether this failure is final for the mutation that produced it.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            SyncError::RejectedByServer(_) | SyncError::RetryBudgetExhausted { .. }
        )
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.into_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(format!("serialization failed: {}", err))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Outcome of a call across the remote confirmation boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeout, connection loss, 5xx. Safe to retry because the service is idempotent per transaction.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Business-rule failure. The mutation will never succeed.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<tokio::time::error::Elapsed> for RemoteError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RemoteError::Transient("request timed out".to_string())
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(msg) => SyncError::TransientNetwork(msg),
            RemoteError::Rejected(msg) => SyncError::RejectedByServer(msg),
        }
    }
}
