//! Types exchanged with branch filesystems.
//!
//! Path-based and inode-free: a branch object is addressed by its path
//! relative to the branch root, which is the same on every branch.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// File attributes (metadata) as reported by one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    pub kind: FileType,
    /// Unix permission bits (e.g. 0o644).
    pub perm: u32,
    pub mtime: SystemTime,
    pub atime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    pub nlink: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileAttr {
    /// Attributes for a freshly created file.
    pub fn file(size: u64, perm: u32) -> Self {
        Self::fresh(FileType::File, size, perm, 1)
    }

    /// Attributes for a freshly created directory.
    pub fn directory(perm: u32) -> Self {
        Self::fresh(FileType::Directory, 0, perm, 2)
    }

    /// Attributes for a freshly created symlink.
    pub fn symlink(target_len: u64) -> Self {
        Self::fresh(FileType::Symlink, target_len, 0o777, 1)
    }

    fn fresh(kind: FileType, size: u64, perm: u32, nlink: u32) -> Self {
        let now = SystemTime::now();
        Self {
            size,
            kind,
            perm,
            mtime: now,
            atime: Some(now),
            ctime: Some(now),
            nlink,
            uid: None,
            gid: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    pub kind: FileType,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, FileType::File)
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, FileType::Directory)
    }
}

/// Attributes to set (for setattr).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl SetAttr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything needed to make another branch's copy carry `attr`'s
    /// metadata. Size is included so a heal leaves files the same length.
    pub fn mirror(attr: &FileAttr) -> Self {
        Self {
            size: attr.is_file().then_some(attr.size),
            mtime: Some(attr.mtime),
            atime: attr.atime,
            perm: Some(attr.perm & 0o7777),
            uid: attr.uid,
            gid: attr.gid,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// True when only the size changes, i.e. this is a data operation.
    pub fn is_truncate_only(&self) -> bool {
        self.size.is_some()
            && self.mtime.is_none()
            && self.atime.is_none()
            && self.perm.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 1024 * 1024,
            bfree: 512 * 1024,
            bavail: 512 * 1024,
            files: 1024 * 1024,
            ffree: 512 * 1024,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        }
    }
}

impl StatFs {
    /// Combine two branches' statistics into the replica's view: capacity
    /// is bounded by the smallest branch because every copy must fit.
    pub fn narrow(self, other: &StatFs) -> StatFs {
        StatFs {
            blocks: self.blocks.min(other.blocks),
            bfree: self.bfree.min(other.bfree),
            bavail: self.bavail.min(other.bavail),
            files: self.files.min(other.files),
            ffree: self.ffree.min(other.ffree),
            bsize: self.bsize,
            namelen: self.namelen.min(other.namelen),
            frsize: self.frsize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_attr_constructors() {
        let file = FileAttr::file(1024, 0o644);
        assert!(file.is_file());
        assert_eq!(file.size, 1024);

        let dir = FileAttr::directory(0o755);
        assert!(dir.is_dir());
        assert_eq!(dir.nlink, 2);
    }

    #[test]
    fn test_mirror_skips_size_for_directories() {
        let dir = FileAttr::directory(0o750);
        let set = SetAttr::mirror(&dir);
        assert_eq!(set.size, None);
        assert_eq!(set.perm, Some(0o750));

        let file = FileAttr::file(12, 0o600);
        assert_eq!(SetAttr::mirror(&file).size, Some(12));
    }

    #[test]
    fn test_truncate_only() {
        assert!(SetAttr::new().with_size(0).is_truncate_only());
        assert!(!SetAttr::new().with_size(0).with_perm(0o600).is_truncate_only());
        assert!(!SetAttr::new().is_truncate_only());
    }

    #[test]
    fn test_statfs_narrow() {
        let big = StatFs::default();
        let small = StatFs {
            blocks: 10,
            bfree: 5,
            ..StatFs::default()
        };
        let merged = big.narrow(&small);
        assert_eq!(merged.blocks, 10);
        assert_eq!(merged.bfree, 5);
    }
}
