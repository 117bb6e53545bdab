//! Error types of the balance engine.

use thiserror::Error;

/// Failures of balance operations.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// The balance would exceed the maximum; state is left unchanged.
    #[error("balance overflow")]
    Overflow,

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Failures of the key-value store or of record decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}
