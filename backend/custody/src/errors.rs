//! Application-wide error types.
//!
//! Two layers: [`ChainError`] is what the escrow contract client reports,
//! [`CustodyError`] is what every stage, job and service returns.  Stages
//! never map an error to a status change on their own; they log a payment
//! event and leave the row where it was so the next tick retries it.

use thiserror::Error;

/// Failure taxonomy of the escrow contract client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// Caller supplied something the contract can never accept.  Not retried.
    #[error("invalid contract parameters: {0}")]
    InvalidParameters(String),

    /// RPC transport failure or node unavailability.  Retried with backoff.
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    /// The contract refused the call.  Surfaced with the decoded reason.
    #[error("transaction reverted: {reason}")]
    Reverted { reason: String },

    /// The transaction was submitted but no receipt arrived before the
    /// confirmation timeout.  Its effect must be re-read later, never re-sent.
    #[error("confirmation timed out for {tx_hash}")]
    Inconclusive { tx_hash: String },

    /// Neither the creation event nor the raw indexed topic yielded an id.
    #[error("escrow id missing from receipt of {tx_hash}")]
    MissingEscrowId { tx_hash: String },
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChainUnavailable(_) | Self::Inconclusive { .. })
    }
}

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller's fault; retrying the same input can never succeed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient failure of an external system; retried on the next tick.
    #[error("External system unavailable: {0}")]
    ExternalUnavailable(String),

    /// A remote system refused the request.
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// Local and remote state disagree; reconciliation required.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Retries exhausted: {0}")]
    ExhaustedRetries(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

impl CustodyError {
    /// Whether the failure is expected to clear up on its own by a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) | Self::Http(_) | Self::ExternalUnavailable(_) => true,
            Self::Chain(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CustodyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_error_retry_classification() {
        assert!(ChainError::ChainUnavailable("timeout".into()).is_retryable());
        assert!(ChainError::Inconclusive {
            tx_hash: "0xabc".into()
        }
        .is_retryable());
        assert!(!ChainError::InvalidParameters("zero amount".into()).is_retryable());
        assert!(!ChainError::Reverted {
            reason: "Pausable: paused".into()
        }
        .is_retryable());
    }

    #[test]
    fn custody_error_wraps_chain_classification() {
        let e: CustodyError = ChainError::ChainUnavailable("503".into()).into();
        assert!(e.is_retryable());
        assert!(!CustodyError::Validation("bad amount".into()).is_retryable());
        assert!(!CustodyError::Inconsistent("escrow mismatch".into()).is_retryable());
    }
}
