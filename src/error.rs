//! Error types for Lodestone
//!
//! Every expected failure carries a stable machine-readable code that is
//! part of the wire contract with clients; only storage faults are opaque.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Missing parameter {0}")]
    MissingParameter(String),
    #[error("Invalid parameter {0}")]
    InvalidParameter(String),
    #[error("Address {0} not found")]
    AddressNotFound(String),
    #[error("Block not found")]
    BlockNotFound,
    #[error("Transaction not found")]
    TransactionNotFound,
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Mining is disabled on this node")]
    MiningDisabled,
    #[error("Transactions are disabled on this node")]
    TransactionsDisabled,
    #[error("Solution incorrect")]
    SolutionIncorrect,
    #[error("Solution duplicate")]
    SolutionDuplicate,
    #[error("Invalid websocket token")]
    InvalidToken,
    #[error("Transaction queue overloaded")]
    QueueOverloaded,
    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Stable wire code, matched by mining and wallet clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::MissingParameter(_) => "missing_parameter",
            LedgerError::InvalidParameter(_) => "invalid_parameter",
            LedgerError::AddressNotFound(_) => "address_not_found",
            LedgerError::BlockNotFound => "block_not_found",
            LedgerError::TransactionNotFound => "transaction_not_found",
            LedgerError::InsufficientFunds => "insufficient_funds",
            LedgerError::AuthFailed => "auth_failed",
            LedgerError::MiningDisabled => "mining_disabled",
            LedgerError::TransactionsDisabled => "transactions_disabled",
            LedgerError::SolutionIncorrect => "solution_incorrect",
            LedgerError::SolutionDuplicate => "solution_duplicate",
            LedgerError::InvalidToken => "invalid_websocket_token",
            LedgerError::QueueOverloaded => "queue_overloaded",
            LedgerError::Database(_) => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            LedgerError::MissingParameter(_) | LedgerError::InvalidParameter(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::AddressNotFound(_)
            | LedgerError::BlockNotFound
            | LedgerError::TransactionNotFound => StatusCode::NOT_FOUND,
            LedgerError::InsufficientFunds | LedgerError::SolutionIncorrect => {
                StatusCode::FORBIDDEN
            }
            LedgerError::AuthFailed | LedgerError::InvalidToken => StatusCode::UNAUTHORIZED,
            LedgerError::MiningDisabled | LedgerError::TransactionsDisabled => StatusCode::LOCKED,
            LedgerError::SolutionDuplicate => StatusCode::CONFLICT,
            LedgerError::QueueOverloaded => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The parameter name for validation failures, used by the wire envelope.
    pub fn parameter(&self) -> Option<&str> {
        match self {
            LedgerError::MissingParameter(p) | LedgerError::InvalidParameter(p) => Some(p),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, LedgerError>;
