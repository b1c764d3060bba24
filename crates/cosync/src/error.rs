//! Error types for the local node.

use cosync_core::{CoId, CoreError};
use cosync_perms::PermsError;
use cosync_store::StoreError;
use cosync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Identifier, crypto or content error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Permission error.
    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// Not found locally, in storage or on any peer.
    #[error("{0} is unavailable")]
    Unavailable(CoId),

    /// Waiting took longer than allowed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The session slot is held by a live process, or by one whose pid
    /// could not be read.
    #[error("session slot {slot} of {account} is locked (holder pid {holder:?})")]
    SessionLocked {
        account: CoId,
        slot: usize,
        holder: Option<u32>,
    },

    /// Lock file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
