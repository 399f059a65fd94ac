mod memory;

#[cfg(test)]
pub(crate) mod intercept;

pub use memory::MemoryVersionStore;
