//! Core types and contracts for nodevault.
//!
//! This crate defines what every backend and service shares:
//! - the version model (`VersionNumber`, `VersionHistory`, `NodeHead`)
//! - the pure lifecycle `state_machine`
//! - repository paths and `LIKE` escaping for tree lock back ends
//! - `VersionStore`: node, version and structural persistence
//! - `TreeLockStore`: the shared tree lock table
//! - `PermissionChecker`, `InvalidationSink`, `ClusterChannel`: collaborators

mod error;
mod head;
mod history;
pub mod like;
mod lock;
mod notify;
pub mod path;
mod policy;
mod security;
pub mod state_machine;
mod store;
mod version;

pub use error::{RepositoryError, RepositoryResult, StorageError, VersionError};
pub use head::{NewNode, NodeHead, NodeId, NodeRecord, NodeTypeId, VersionEntry, VersionSnapshot};
pub use history::{VersionChange, VersionHistory};
pub use lock::{LockId, LockInsertResult, TreeLock, TreeLockStore};
pub use notify::{ClusterChannel, ClusterMessage, InvalidationEvent, InvalidationReason, InvalidationSink};
pub use path::{PathError, RepositoryPath};
pub use policy::{ApprovingMode, ApprovingSetting, VersionPolicy, VersioningMode, VersioningSetting};
pub use security::{Permission, PermissionChecker};
pub use state_machine::{transition, Transition, TransitionEffect};
pub use store::VersionStore;
pub use version::{OperationKind, Properties, Version, VersionId, VersionNumber, VersionOperation, VersionStatus};
