use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::head::NodeId;

/// Permissions the engine asks the security collaborator about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Open,
    /// See versions that are not approved yet.
    OpenMinor,
    Save,
    Publish,
    Approve,
    AddNew,
    Delete,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Open => "open",
            Permission::OpenMinor => "open-minor",
            Permission::Save => "save",
            Permission::Publish => "publish",
            Permission::Approve => "approve",
            Permission::AddNew => "add-new",
            Permission::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Externally supplied authorization check. The engine only asks.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn has_permission(
        &self,
        node_id: NodeId,
        permission: Permission,
    ) -> Result<bool, StorageError>;
}
