//! Quota Error Types
//!
//! Genuine failures of the quota engine. Running out of quota is not an
//! error: it is the `allowed == false` branch of a [`Decision`].
//!
//! [`Decision`]: super::guard::Decision

use std::time::Duration;

/// Result type alias for quota operations
pub type QuotaResult<T> = Result<T, QuotaError>;

/// Error types for quota operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    /// The referenced user does not exist
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// No policy entry resolves for a tier/action pair
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient failure in the usage ledger
    #[error("Storage error: {0}")]
    Storage(String),

    /// The caller's deadline elapsed before the operation finished
    #[error("Quota operation timed out after {0:?}")]
    DeadlineExceeded(Duration),
}

impl QuotaError {
    /// Whether a caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuotaError::Storage(_))
    }

    /// HTTP-equivalent status code for surfacing the error
    pub fn status_code(&self) -> u16 {
        match self {
            QuotaError::UserNotFound(_) => 404,
            QuotaError::Configuration(_) => 500,
            QuotaError::Storage(_) => 503,
            QuotaError::DeadlineExceeded(_) => 504,
        }
    }
}

impl From<std::io::Error> for QuotaError {
    fn from(err: std::io::Error) -> Self {
        QuotaError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(err: serde_json::Error) -> Self {
        QuotaError::Storage(format!("malformed ledger record: {}", err))
    }
}
