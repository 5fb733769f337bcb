use bigdecimal::BigDecimal;
use uuid::Uuid;

/// Failures of the wallet ledger and its store.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: BigDecimal,
        available: BigDecimal,
    },
    #[error("Wallet not found for account {0}")]
    WalletNotFound(Uuid),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// Insufficient balance is an expected, recoverable outcome rather than a
    /// fault; callers route it to the `queued` state.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, LedgerError::InsufficientFunds { .. })
    }
}

/// Failures of the message and account repositories.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_insufficient_funds_is_distinct() {
        let err = LedgerError::InsufficientFunds {
            required: BigDecimal::from_str("0.02").unwrap(),
            available: BigDecimal::from_str("0.01").unwrap(),
        };
        assert!(err.is_insufficient_funds());
        assert_eq!(
            err.to_string(),
            "Insufficient funds: required 0.02, available 0.01"
        );
        assert!(!LedgerError::WalletNotFound(Uuid::nil()).is_insufficient_funds());
    }
}
