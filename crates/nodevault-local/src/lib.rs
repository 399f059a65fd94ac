//! Local back ends and engine services for nodevault.
//!
//! - `storage`: in-memory `VersionStore`
//! - `lock`: in-memory and file-backed `TreeLockStore`s, `TreeLockRegistry`
//! - `resolver` and `cache`: race-tolerant head and version reads
//! - `service` and `service_tree`: version lifecycle and structural operations

pub mod cache;
pub mod cancel;
pub mod lock;
pub mod notify;
pub mod resolver;
pub mod security;
pub mod service;
pub mod service_tree;
pub mod storage;

pub use cache::HeadCache;
pub use cancel::{CancellationSignal, CancellationSource};
pub use lock::{FileTreeLockStore, MemoryTreeLockStore, TreeLockGuard, TreeLockRegistry};
pub use notify::{BroadcastCluster, NoopInvalidation, Notifier};
pub use resolver::{HeadResolver, VersionSelector};
pub use security::{AllowAll, PermissionTable};
pub use service::VersionService;
pub use service_tree::TreeService;
pub use storage::MemoryVersionStore;
