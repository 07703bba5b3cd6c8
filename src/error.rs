//! Error types for the sync layer.
//!
//! `SyncError` covers synchronous construction failures only. Failures of
//! live subscriptions and submitted mutations travel as [`ErrorInfo`]
//! values to consumers and to the error surface instead.
//!
//! [`ErrorInfo`]: crate::types::ErrorInfo

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Store not available")]
    StoreUnavailable,

    #[error("Mutation dispatcher is closed")]
    DispatcherClosed,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
