mod file;
mod memory;
mod registry;

pub use file::FileTreeLockStore;
pub use memory::MemoryTreeLockStore;
pub use registry::{TreeLockGuard, TreeLockRegistry};
