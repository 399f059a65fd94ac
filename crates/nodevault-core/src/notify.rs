//! Outbound notifications: cache invalidation and cluster messages.
//!
//! Both are delivery mechanisms only. Correctness is enforced by the shared
//! stores, so a lost notification can make a cache stale but can never let
//! two processes hold overlapping tree locks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::head::{NodeId, NodeTypeId};
use crate::lock::LockId;
use crate::path::RepositoryPath;
use crate::version::OperationKind;

/// Why a node's cached state went stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "operation", rename_all = "snake_case")]
pub enum InvalidationReason {
    Version(OperationKind),
    Created,
    Moved,
    Copied,
    Renamed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub node_id: NodeId,
    pub path: RepositoryPath,
    pub node_type_id: NodeTypeId,
    pub reason: InvalidationReason,
}

/// Cache invalidation layer; notified, never queried.
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    async fn invalidate(&self, event: &InvalidationEvent);
}

/// Messages exchanged between cooperating processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    LockAcquired {
        lock_id: LockId,
        path: RepositoryPath,
        owner: String,
    },
    LockReleased {
        lock_id: LockId,
        path: RepositoryPath,
    },
    HeadInvalidated {
        node_id: NodeId,
        path: RepositoryPath,
    },
}

/// Pub/sub transport between processes.
///
/// `publish` is fire-and-forget so it can be called from a lock guard's
/// destructor.
pub trait ClusterChannel: Send + Sync {
    fn publish(&self, message: ClusterMessage) -> Result<(), StorageError>;
}
