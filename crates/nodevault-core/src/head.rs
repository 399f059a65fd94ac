use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::VersionHistory;
use crate::path::RepositoryPath;
use crate::policy::{ApprovingSetting, VersioningSetting};
use crate::version::{Properties, Version, VersionId, VersionNumber, VersionStatus};

/// Stable identity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content type of a node, owned by the schema system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeTypeId(pub u32);

impl fmt::Display for NodeTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structural record of a node (everything but its versions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub path: RepositoryPath,
    pub node_type_id: NodeTypeId,
    #[serde(default)]
    pub versioning: VersioningSetting,
    #[serde(default)]
    pub approving: ApprovingSetting,
    pub created_at: DateTime<Utc>,
}

/// Request to create a node; the store assigns id and path.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    /// `None` creates a root node.
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub node_type_id: NodeTypeId,
    pub versioning: VersioningSetting,
    pub approving: ApprovingSetting,
}

impl NewNode {
    pub fn new(parent_id: Option<NodeId>, name: impl Into<String>, node_type_id: NodeTypeId) -> Self {
        Self {
            parent_id,
            name: name.into(),
            node_type_id,
            versioning: VersioningSetting::Inherited,
            approving: ApprovingSetting::Inherited,
        }
    }

    pub fn with_versioning(mut self, versioning: impl Into<VersioningSetting>) -> Self {
        self.versioning = versioning.into();
        self
    }

    pub fn with_approving(mut self, approving: impl Into<ApprovingSetting>) -> Self {
        self.approving = approving.into();
        self
    }
}

/// Number and status of one version as seen by a [`NodeHead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub id: VersionId,
    pub number: VersionNumber,
    pub status: VersionStatus,
}

/// Immutable point-in-time projection of a node and its version list.
///
/// A head is never patched: every commit produces a new one from the
/// committed history. Readers may hold on to an old head; the versions it
/// points at may have vanished since, which is what
/// the head resolver is prepared for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHead {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub path: RepositoryPath,
    pub node_type_id: NodeTypeId,
    /// Store revision of the history this head was built from.
    pub revision: u64,
    pub versions: Vec<VersionEntry>,
    /// Latest `Approved` version.
    pub last_major_version_id: Option<VersionId>,
    /// Latest version reachable for editing (locked, draft, pending or approved).
    pub last_minor_version_id: Option<VersionId>,
    pub locked_by: Option<String>,
}

impl NodeHead {
    pub fn build(node: &NodeRecord, history: &VersionHistory) -> Self {
        Self {
            node_id: node.id,
            parent_id: node.parent_id,
            name: node.name.clone(),
            path: node.path.clone(),
            node_type_id: node.node_type_id,
            revision: history.revision(),
            versions: history
                .versions()
                .iter()
                .map(|v| VersionEntry {
                    id: v.id,
                    number: v.number,
                    status: v.status,
                })
                .collect(),
            last_major_version_id: history.last_major().map(|v| v.id),
            last_minor_version_id: history.head().map(|v| v.id),
            locked_by: history.locked().and_then(|v| v.locked_by.clone()),
        }
    }

    pub fn entry(&self, id: VersionId) -> Option<&VersionEntry> {
        self.versions.iter().find(|e| e.id == id)
    }

    pub fn entry_by_number(&self, number: VersionNumber) -> Option<&VersionEntry> {
        self.versions.iter().find(|e| e.number == number)
    }

    pub fn is_checked_out(&self) -> bool {
        self.versions.iter().any(|e| e.status == VersionStatus::Locked)
    }

    /// `"V1.0.A,V2.0.L"`, in history order.
    pub fn summary(&self) -> String {
        self.versions
            .iter()
            .map(|e| e.number.with_status(e.status))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Fully hydrated version of a node as returned to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub path: RepositoryPath,
    pub node_type_id: NodeTypeId,
    pub version_id: VersionId,
    pub number: VersionNumber,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    pub properties: Properties,
}

impl VersionSnapshot {
    pub fn new(head: &NodeHead, version: Version) -> Self {
        Self {
            node_id: head.node_id,
            parent_id: head.parent_id,
            name: head.name.clone(),
            path: head.path.clone(),
            node_type_id: head.node_type_id,
            version_id: version.id,
            number: version.number,
            status: version.status,
            created_at: version.created_at,
            properties: version.properties,
        }
    }

    pub fn label(&self) -> String {
        self.number.with_status(self.status)
    }
}
