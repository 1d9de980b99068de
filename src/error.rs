//! Error types for the transaction engine

use ethers::types::{H256, U256};
use thiserror::Error;

/// Classified failure reported by the ledger collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Network failure or node rejection. The node's message is kept verbatim
    /// so that nonce faults can be recognised by the engine.
    #[error("ledger rpc error: {0}")]
    Rpc(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("malformed ledger response: {0}")]
    Malformed(String),
}

/// Main error type for the transactor
#[derive(Error, Debug)]
pub enum TransactorError {
    #[error("pre-condition check failed")]
    PreConditionFailed,

    #[error("post-condition check failed")]
    PostConditionFailed,

    /// Another transaction holds the same nonce at an equal or higher price.
    #[error("nonce is out of sync")]
    NonceOutOfSync,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Gas oracle error: {0}")]
    GasOracle(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("gas price must be positive")]
    InvalidGasPrice,

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Timeout waiting for inclusion of {tx_hash:?}")]
    InclusionTimeout { tx_hash: H256 },

    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: U256, need: U256 },
}

impl TransactorError {
    /// Check if error was produced by a deadline or an explicit cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TransactorError::DeadlineExceeded | TransactorError::Cancelled
        )
    }

    /// Check if the engine may absorb the error and try again
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransactorError::PreConditionFailed
                | TransactorError::PostConditionFailed
                | TransactorError::NonceOutOfSync
                | TransactorError::DeadlineExceeded
                | TransactorError::Cancelled
                | TransactorError::Wallet(_)
                | TransactorError::InvalidGasPrice
                | TransactorError::InsufficientBalance { .. }
        )
    }

    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            TransactorError::PreConditionFailed => "pre_condition",
            TransactorError::PostConditionFailed => "post_condition",
            TransactorError::NonceOutOfSync => "nonce_out_of_sync",
            TransactorError::DeadlineExceeded => "deadline",
            TransactorError::Cancelled => "cancelled",
            TransactorError::Ledger(_) => "ledger",
            TransactorError::GasOracle(_) => "gas_oracle",
            TransactorError::Wallet(_) => "wallet",
            TransactorError::Config(_) => "config",
            TransactorError::InvalidGasPrice => "invalid_gas_price",
            TransactorError::Metrics(_) => "metrics",
            TransactorError::InclusionTimeout { .. } => "inclusion_timeout",
            TransactorError::InsufficientBalance { .. } => "insufficient_balance",
        }
    }
}

/// Result type for transactor operations
pub type TransactorResult<T> = Result<T, TransactorError>;
