//! Branch filesystem abstraction.
//!
//! A replica sits above N branch filesystems. Each one is reached through
//! [`BranchOps`]; the two concrete backends are:
//!
//! - [`MemoryBackend`] - in-memory branch (scratch, tests)
//! - [`LocalBackend`] - a directory on a local filesystem
//!
//! Calls are path-based: the same relative path names the same logical
//! object on every branch.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{BranchError, BranchResult};
pub use ops::BranchOps;
pub use types::{DirEntry, FileAttr, FileType, SetAttr, StatFs};
