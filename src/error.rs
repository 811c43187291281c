//! Error types for the sync layer.

use crate::types::Collection;
use thiserror::Error;

/// Main error type for sync operations.
///
/// Nothing here is fatal: authentication and network failures leave state
/// untouched and are retried by the user, malformed data degrades to absent
/// fields, and a failed subscription leaves its siblings running.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials were rejected by the credential exchange.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Transport failure talking to a remote collaborator.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to open subscription for {collection}: {reason}")]
    Subscription {
        collection: Collection,
        reason: String,
    },

    #[error("Malformed {collection} data: {reason}")]
    MalformedData {
        collection: Collection,
        reason: String,
    },

    /// Persisted session could not be read or written.
    #[error("Session storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
