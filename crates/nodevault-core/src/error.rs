use thiserror::Error;

use crate::head::NodeId;
use crate::path::PathError;
use crate::security::Permission;
use crate::version::{OperationKind, VersionNumber, VersionStatus};

/// Errors that can occur in the storage layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The history was committed by someone else since it was loaded.
    #[error("Revision conflict on node {node_id}: expected {expected}, found {actual}")]
    Conflict {
        node_id: NodeId,
        expected: u64,
        actual: u64,
    },

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the version state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// `CheckOut` on a node that already has a `Locked` version.
    #[error("node {node_id} is already checked out as {version}{}", owner_suffix(.owner))]
    VersionLocked {
        node_id: NodeId,
        version: VersionNumber,
        owner: Option<String>,
    },

    /// A lifecycle call targeted a version that is not in the required status.
    #[error(
        "cannot {operation} node {node_id}: requires a {expected} version, found {}",
        found_display(.found)
    )]
    InvalidTransition {
        node_id: NodeId,
        operation: OperationKind,
        expected: &'static str,
        found: Option<VersionStatus>,
    },

    /// A change list would break a history invariant.
    #[error("version history invariant violated on node {node_id}: {reason}")]
    InvariantViolation { node_id: NodeId, reason: String },
}

fn owner_suffix(owner: &Option<String>) -> String {
    owner
        .as_deref()
        .map(|o| format!(" by {}", o))
        .unwrap_or_default()
}

fn found_display(found: &Option<VersionStatus>) -> String {
    found
        .map(|s| s.to_string())
        .unwrap_or_else(|| "no version".to_string())
}

/// Top-level error type of the repository engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Path(#[from] PathError),

    /// A tree lock overlapping the requested path is held.
    #[error("tree is locked: {path} overlaps {}", .held.join(", "))]
    LockedTree { path: String, held: Vec<String> },

    #[error("permission denied: {permission} on node {node_id}")]
    PermissionDenied {
        node_id: NodeId,
        permission: Permission,
    },

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The node was moved by someone else between reading its path and
    /// locking that path.
    #[error("node {node_id} moved from {locked} to {current} while being locked")]
    NodeMoved {
        node_id: NodeId,
        locked: String,
        current: String,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl RepositoryError {
    /// Whether a caller may reasonably retry. The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepositoryError::LockedTree { .. }
                | RepositoryError::NodeMoved { .. }
                | RepositoryError::Storage(StorageError::Conflict { .. })
        )
    }

    pub fn locked_tree(path: impl Into<String>, held: Vec<String>) -> Self {
        Self::LockedTree {
            path: path.into(),
            held,
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        let locked = RepositoryError::locked_tree("/Root/A", vec!["/Root".to_string()]);
        assert!(locked.is_retryable());

        let conflict = RepositoryError::from(StorageError::Conflict {
            node_id: NodeId(1),
            expected: 1,
            actual: 2,
        });
        assert!(conflict.is_retryable());

        let moved = RepositoryError::NodeMoved {
            node_id: NodeId(3),
            locked: "/Root/A/X".to_string(),
            current: "/Root/B/X".to_string(),
        };
        assert!(moved.is_retryable());
        assert_eq!(moved.to_string(), "node 3 moved from /Root/A/X to /Root/B/X while being locked");

        let transition = RepositoryError::from(VersionError::InvalidTransition {
            node_id: NodeId(1),
            operation: OperationKind::Approve,
            expected: "pending",
            found: Some(VersionStatus::Draft),
        });
        assert!(!transition.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = VersionError::VersionLocked {
            node_id: NodeId(7),
            version: VersionNumber::new(2, 0),
            owner: Some("alice".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "node 7 is already checked out as V2.0 by alice"
        );

        let err = VersionError::InvalidTransition {
            node_id: NodeId(7),
            operation: OperationKind::CheckIn,
            expected: "locked",
            found: None,
        };
        assert_eq!(
            err.to_string(),
            "cannot check-in node 7: requires a locked version, found no version"
        );
    }
}
