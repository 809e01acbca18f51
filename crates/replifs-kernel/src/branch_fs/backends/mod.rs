//! Branch filesystem backends.
//!
//! Backends implement [`BranchOps`](super::BranchOps) for different storage types.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
