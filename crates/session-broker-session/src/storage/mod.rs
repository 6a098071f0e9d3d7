//! Storage implementations.

pub mod fs;
#[cfg(feature = "memory")]
pub mod memory;

pub use fs::FsStorage;
#[cfg(feature = "memory")]
pub use memory::MemoryStorage;
