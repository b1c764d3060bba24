//! Error types for the permissions module.

use thiserror::Error;

use cosync_core::{ActorId, CoId};

/// Errors that can occur during group operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An admin may only downgrade or remove itself.
    #[error("cannot downgrade or remove admin {0}")]
    CannotDowngradeAdmin(ActorId),

    /// The CoValue is not a group.
    #[error("{0} is not a group")]
    NotAGroup(CoId),

    /// A CoValue needed for the operation is not loaded.
    #[error("dependency {0} is not available")]
    MissingDependency(CoId),

    /// The current read key of a group is not readable by us.
    #[error("no readable key for group {0}")]
    MissingReadKey(CoId),

    /// A member's sealer is unknown, so keys cannot be shared with it.
    #[error("no sealer known for member {0}")]
    MissingSealer(ActorId),

    /// Extending would create a cycle of parent groups.
    #[error("group {child} is already an ancestor of {parent}")]
    ExtendCycle { child: CoId, parent: CoId },

    /// Invalid role for this operation.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// Invite secret does not grant anything in the group.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] cosync_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
