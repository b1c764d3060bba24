//! Error types for the sync module.

use thiserror::Error;

use crate::messages::PeerId;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A message could not be encoded or decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The peer's connection is closed.
    #[error("peer disconnected: {0}")]
    Disconnected(PeerId),

    /// Storage failed while applying or serving content.
    #[error("store error: {0}")]
    StoreError(#[from] cosync_store::StoreError),

    /// Content could not be verified.
    #[error("core error: {0}")]
    CoreError(#[from] cosync_core::CoreError),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
