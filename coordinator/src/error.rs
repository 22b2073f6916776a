//! Error types for the coordinator
//!
//! Every variant carries a stable numeric code that is part of the RPC wire
//! format; codes must never be renumbered.

use thiserror::Error;

/// Main error type for coordinator operations
#[derive(Error, Debug, Clone)]
pub enum CoordinatorError {
    #[error("invalid currency {0}")]
    InvalidCurrency(String),

    #[error("unable to connect to wallet: {0}")]
    NoSession(String),

    #[error("insufficient funds for {0}")]
    InsufficientFunds(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not an exchange node")]
    NotExchangeNode,

    #[error("invalid detail level")]
    InvalidDetailLevel,

    #[error("chain connection error for {currency}: {message}")]
    ChainConnection { currency: String, message: String },

    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CoordinatorError {
    /// Stable numeric code reported in RPC error envelopes.
    pub fn code(&self) -> u32 {
        match self {
            CoordinatorError::InvalidCurrency(_) => 1001,
            CoordinatorError::NoSession(_) => 1002,
            CoordinatorError::InsufficientFunds(_) => 1003,
            CoordinatorError::TransactionNotFound(_) => 1005,
            CoordinatorError::InvalidAmount(_) => 1008,
            CoordinatorError::InvalidParameters(_) => 1009,
            CoordinatorError::InvalidAddress(_) => 1010,
            CoordinatorError::InvalidState(_) => 1012,
            CoordinatorError::NotExchangeNode => 1013,
            CoordinatorError::InvalidDetailLevel => 1016,
            CoordinatorError::ChainConnection { .. }
            | CoordinatorError::Timeout { .. }
            | CoordinatorError::Unknown(_) => 3000,
        }
    }

    /// Check if the error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::ChainConnection { .. } | CoordinatorError::Timeout { .. }
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoordinatorError::InvalidCurrency(String::new()).code(), 1001);
        assert_eq!(CoordinatorError::NoSession(String::new()).code(), 1002);
        assert_eq!(CoordinatorError::InsufficientFunds(String::new()).code(), 1003);
        assert_eq!(CoordinatorError::TransactionNotFound(String::new()).code(), 1005);
        assert_eq!(CoordinatorError::InvalidAmount(String::new()).code(), 1008);
        assert_eq!(CoordinatorError::InvalidParameters(String::new()).code(), 1009);
        assert_eq!(CoordinatorError::InvalidAddress(String::new()).code(), 1010);
        assert_eq!(CoordinatorError::InvalidState(String::new()).code(), 1012);
        assert_eq!(CoordinatorError::NotExchangeNode.code(), 1013);
        assert_eq!(CoordinatorError::InvalidDetailLevel.code(), 1016);
        assert_eq!(CoordinatorError::Unknown(String::new()).code(), 3000);
    }

    #[test]
    fn retryable_split() {
        assert!(CoordinatorError::Timeout { operation: "poll".into() }.is_retryable());
        assert!(CoordinatorError::ChainConnection {
            currency: "LTC".into(),
            message: "refused".into()
        }
        .is_retryable());
        assert!(!CoordinatorError::InvalidParameters("x".into()).is_retryable());
        assert!(!CoordinatorError::NotExchangeNode.is_retryable());
    }
}
