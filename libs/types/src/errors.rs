//! Error types for ledger mutations
//!
//! Validation failures are raised before any state is touched, so a
//! rejected call leaves the store exactly as it was.

use thiserror::Error;

/// Top-level error for in-memory ledger operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transaction not found: {id}")]
    NotFound { id: String },

    #[error("Budget not found: {id}")]
    BudgetNotFound { id: String },
}

/// Rejected input on append/update
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid date: {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("Amount is not a finite number: {0}")]
    NonFiniteAmount(f64),

    #[error("Empty identifier")]
    EmptyIdentifier,

    #[error("Duplicate transaction id: {0}")]
    DuplicateId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::MissingField("currency");
        assert_eq!(err.to_string(), "Missing required field: currency");
    }

    #[test]
    fn test_ledger_error_from_validation() {
        let err: LedgerError = ValidationError::EmptyIdentifier.into();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(err.to_string().contains("Empty identifier"));
    }
}
