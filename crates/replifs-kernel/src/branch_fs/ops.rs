//! Branch filesystem operations trait.
//!
//! Every underlying filesystem a replica stacks on implements this trait.
//! Calls are path-based and relative to the branch root.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::types::{DirEntry, FileAttr, SetAttr, StatFs};
use super::BranchResult;

/// POSIX-like operations a branch filesystem exposes to the dispatcher.
#[async_trait]
pub trait BranchOps: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// Get attributes without following a trailing symlink.
    async fn getattr(&self, path: &Path) -> BranchResult<FileAttr>;

    /// Read all directory entries, sorted by name.
    async fn readdir(&self, path: &Path) -> BranchResult<Vec<DirEntry>>;

    /// Read up to `size` bytes starting at `offset`. Short at EOF.
    async fn read(&self, path: &Path, offset: u64, size: u32) -> BranchResult<Vec<u8>>;

    async fn readlink(&self, path: &Path) -> BranchResult<PathBuf>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> BranchResult<u32>;

    /// Create a regular file; fails if anything exists at `path`.
    async fn create(&self, path: &Path, mode: u32) -> BranchResult<FileAttr>;

    async fn mkdir(&self, path: &Path, mode: u32) -> BranchResult<FileAttr>;

    async fn unlink(&self, path: &Path) -> BranchResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &Path) -> BranchResult<()>;

    async fn rename(&self, from: &Path, to: &Path) -> BranchResult<()>;

    async fn truncate(&self, path: &Path, size: u64) -> BranchResult<()>;

    async fn setattr(&self, path: &Path, attr: SetAttr) -> BranchResult<FileAttr>;

    /// Create a symlink at `path` pointing to `target`.
    async fn symlink(&self, path: &Path, target: &Path) -> BranchResult<FileAttr>;

    /// Create a hard link at `newpath` pointing to `oldpath`.
    async fn link(&self, oldpath: &Path, newpath: &Path) -> BranchResult<FileAttr>;

    /// Flush file data to stable storage.
    async fn fsync(&self, path: &Path) -> BranchResult<()>;

    // ========================================================================
    // Extended attributes
    // ========================================================================

    /// Fails with [`super::BranchError::NoData`] when the attribute is unset.
    async fn getxattr(&self, path: &Path, name: &str) -> BranchResult<Vec<u8>>;

    /// Create or replace an attribute.
    async fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> BranchResult<()>;

    async fn removexattr(&self, path: &Path, name: &str) -> BranchResult<()>;

    async fn listxattr(&self, path: &Path) -> BranchResult<Vec<String>>;

    // ========================================================================
    // Metadata
    // ========================================================================

    fn read_only(&self) -> bool;

    async fn statfs(&self) -> BranchResult<StatFs>;

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    async fn exists(&self, path: &Path) -> bool {
        self.getattr(path).await.is_ok()
    }

    /// Read entire file contents.
    async fn read_all(&self, path: &Path) -> BranchResult<Vec<u8>> {
        let attr = self.getattr(path).await?;
        self.read(path, 0, attr.size as u32).await
    }
}
