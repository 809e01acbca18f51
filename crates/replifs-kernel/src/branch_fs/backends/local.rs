//! Local filesystem branch.
//!
//! A branch rooted at a directory on a real filesystem. Paths never escape
//! the root, and the last path component is never followed: the replica
//! manages symlinks as objects in their own right.

use async_trait::async_trait;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::branch_fs::error::{BranchError, BranchResult};
use crate::branch_fs::ops::BranchOps;
use crate::branch_fs::types::{DirEntry, FileAttr, FileType, SetAttr, StatFs};

/// Local filesystem branch.
///
/// All operations are relative to `root`. If `root` is `/srv/b0`, then
/// `read("docs/a.txt")` reads `/srv/b0/docs/a.txt`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    read_only: bool,
}

impl LocalBackend {
    /// Create a branch rooted at the given directory.
    ///
    /// The root is canonicalized at construction time so later containment
    /// checks compare like with like (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            read_only: false,
        }
    }

    /// Create a read-only branch.
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        let mut backend = Self::new(root);
        backend.read_only = true;
        backend
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a branch-relative path to an absolute path under the root.
    ///
    /// Intermediate directories are canonicalized; the final component is
    /// kept as-is so a symlink there is addressed, not followed.
    fn resolve(&self, path: &Path) -> BranchResult<PathBuf> {
        let path = path.strip_prefix("/").unwrap_or(path);
        if path.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(BranchError::path_escapes_root(path.display().to_string()));
        }

        let full = self.root.join(path);
        let name = full
            .file_name()
            .ok_or_else(|| BranchError::invalid_path("no filename"))?;
        let parent = full
            .parent()
            .ok_or_else(|| BranchError::invalid_path("no parent"))?;

        if !parent.exists() {
            // Parent is missing; the operation itself reports ENOENT.
            return Ok(full);
        }

        let canonical_parent = dunce::canonicalize(parent)?;
        if !canonical_parent.starts_with(&self.root) {
            return Err(BranchError::path_escapes_root(format!(
                "{} is not under {}",
                canonical_parent.display(),
                self.root.display()
            )));
        }
        Ok(canonical_parent.join(name))
    }

    fn check_writable(&self) -> BranchResult<()> {
        if self.read_only {
            Err(BranchError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };

        FileAttr {
            size: meta.len(),
            kind,
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
            ctime: meta.created().ok(),
            nlink: meta.nlink() as u32,
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        }
    }
}

#[async_trait]
impl BranchOps for LocalBackend {
    async fn getattr(&self, path: &Path) -> BranchResult<FileAttr> {
        let full_path = self.resolve(path)?;
        let meta = fs::symlink_metadata(&full_path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn readdir(&self, path: &Path) -> BranchResult<Vec<DirEntry>> {
        let full_path = self.resolve(path)?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else if file_type.is_symlink() {
                FileType::Symlink
            } else {
                FileType::File
            };
            entries.push(DirEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                kind,
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> BranchResult<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let full_path = self.resolve(path)?;
        let mut file = fs::File::open(&full_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    async fn readlink(&self, path: &Path) -> BranchResult<PathBuf> {
        let full_path = self.resolve(path)?;
        match fs::read_link(&full_path).await {
            Ok(target) => Ok(target),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Err(BranchError::NotASymlink(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> BranchResult<u32> {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};

        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let mut file = fs::OpenOptions::new().write(true).open(&full_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u32)
    }

    async fn create(&self, path: &Path, mode: u32) -> BranchResult<FileAttr> {
        use std::os::unix::fs::OpenOptionsExt;

        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&full_path)?;
        let meta = file.metadata()?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> BranchResult<FileAttr> {
        use std::os::unix::fs::DirBuilderExt;

        self.check_writable()?;
        let full_path = self.resolve(path)?;
        std::fs::DirBuilder::new().mode(mode).create(&full_path)?;
        let meta = fs::symlink_metadata(&full_path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn unlink(&self, path: &Path) -> BranchResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        Ok(fs::remove_file(&full_path).await?)
    }

    async fn rmdir(&self, path: &Path) -> BranchResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        if full_path == self.root {
            return Err(BranchError::permission_denied("cannot remove root"));
        }
        Ok(fs::remove_dir(&full_path).await?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> BranchResult<()> {
        self.check_writable()?;
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        Ok(fs::rename(&from_path, &to_path).await?)
    }

    async fn truncate(&self, path: &Path, size: u64) -> BranchResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let file = fs::OpenOptions::new().write(true).open(&full_path).await?;
        Ok(file.set_len(size).await?)
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> BranchResult<FileAttr> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let meta = fs::symlink_metadata(&full_path).await?;
        let is_symlink = meta.file_type().is_symlink();

        if let Some(size) = attr.size {
            let file = fs::OpenOptions::new().write(true).open(&full_path).await?;
            file.set_len(size).await?;
        }

        if let (Some(perm), false) = (attr.perm, is_symlink) {
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(perm)).await?;
        }

        let uid = attr.uid.filter(|uid| *uid != meta.uid());
        let gid = attr.gid.filter(|gid| *gid != meta.gid());
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::lchown(&full_path, uid, gid)?;
        }

        // Symlink times are left alone: there is no portable lutimes in std.
        if (attr.mtime.is_some() || attr.atime.is_some()) && !is_symlink {
            let mut times = std::fs::FileTimes::new();
            if let Some(mtime) = attr.mtime {
                times = times.set_modified(mtime);
            }
            if let Some(atime) = attr.atime {
                times = times.set_accessed(atime);
            }
            std::fs::File::open(&full_path)?.set_times(times)?;
        }

        self.getattr(path).await
    }

    async fn symlink(&self, path: &Path, target: &Path) -> BranchResult<FileAttr> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        fs::symlink(target, &full_path).await?;
        self.getattr(path).await
    }

    async fn link(&self, oldpath: &Path, newpath: &Path) -> BranchResult<FileAttr> {
        self.check_writable()?;
        let old_full = self.resolve(oldpath)?;
        let new_full = self.resolve(newpath)?;
        fs::hard_link(&old_full, &new_full).await?;
        self.getattr(newpath).await
    }

    async fn fsync(&self, path: &Path) -> BranchResult<()> {
        let full_path = self.resolve(path)?;
        let file = fs::File::open(&full_path).await?;
        Ok(file.sync_all().await?)
    }

    async fn getxattr(&self, path: &Path, name: &str) -> BranchResult<Vec<u8>> {
        let full_path = self.resolve(path)?;
        let name = name.to_owned();
        blocking(move || xattr::get(&full_path, &name)).await
    }

    async fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> BranchResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let (name, value) = (name.to_owned(), value.to_vec());
        blocking(move || xattr::set(&full_path, &name, &value)).await
    }

    async fn removexattr(&self, path: &Path, name: &str) -> BranchResult<()> {
        self.check_writable()?;
        let full_path = self.resolve(path)?;
        let name = name.to_owned();
        blocking(move || xattr::remove(&full_path, &name)).await
    }

    async fn listxattr(&self, path: &Path) -> BranchResult<Vec<String>> {
        let full_path = self.resolve(path)?;
        blocking(move || xattr::list(&full_path)).await
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn statfs(&self) -> BranchResult<StatFs> {
        use rustix::fs::statvfs;

        let root = self.root.clone();
        let stat = blocking(move || statvfs(&root).map_err(|e| BranchError::Io(e.into()))).await?;
        Ok(StatFs {
            blocks: stat.f_blocks,
            bfree: stat.f_bfree,
            bavail: stat.f_bavail,
            files: stat.f_files,
            ffree: stat.f_ffree,
            bsize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
            frsize: stat.f_frsize as u32,
        })
    }
}

/// Run a blocking syscall on tokio's blocking pool.
async fn blocking<T, F>(call: F) -> BranchResult<T>
where
    F: FnOnce() -> BranchResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| BranchError::other(format!("blocking task failed: {e}")))?
}

/// Extended attribute calls that do not follow a trailing symlink.
#[cfg(target_os = "linux")]
mod xattr {
    use rustix::fs::{XattrFlags, lgetxattr, llistxattr, lremovexattr, lsetxattr};
    use rustix::io::Errno;
    use std::path::Path;

    use crate::branch_fs::error::{BranchError, BranchResult};

    fn map_errno(e: Errno, name: &str) -> BranchError {
        if e == Errno::NODATA {
            BranchError::no_data(name)
        } else if e == Errno::OPNOTSUPP {
            BranchError::Unsupported(format!("xattr {name}"))
        } else {
            BranchError::Io(e.into())
        }
    }

    pub(super) fn get(path: &Path, name: &str) -> BranchResult<Vec<u8>> {
        loop {
            let len = lgetxattr(path, name, &mut []).map_err(|e| map_errno(e, name))?;
            let mut value = vec![0u8; len];
            match lgetxattr(path, name, &mut value) {
                Ok(n) => {
                    value.truncate(n);
                    return Ok(value);
                }
                // Grew between the two calls.
                Err(Errno::RANGE) => continue,
                Err(e) => return Err(map_errno(e, name)),
            }
        }
    }

    pub(super) fn set(path: &Path, name: &str, value: &[u8]) -> BranchResult<()> {
        lsetxattr(path, name, value, XattrFlags::empty()).map_err(|e| map_errno(e, name))
    }

    pub(super) fn remove(path: &Path, name: &str) -> BranchResult<()> {
        lremovexattr(path, name).map_err(|e| map_errno(e, name))
    }

    pub(super) fn list(path: &Path) -> BranchResult<Vec<String>> {
        loop {
            let len = llistxattr(path, &mut []).map_err(|e| map_errno(e, "list"))?;
            let mut raw = vec![0u8; len];
            match llistxattr(path, &mut raw) {
                Ok(n) => {
                    return Ok(raw[..n]
                        .split(|b| *b == 0)
                        .filter(|name| !name.is_empty())
                        .map(|name| String::from_utf8_lossy(name).into_owned())
                        .collect());
                }
                Err(Errno::RANGE) => continue,
                Err(e) => return Err(map_errno(e, "list")),
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod xattr {
    use std::path::Path;

    use crate::branch_fs::error::{BranchError, BranchResult};

    pub(super) fn get(_path: &Path, name: &str) -> BranchResult<Vec<u8>> {
        Err(BranchError::Unsupported(format!("xattr {name}")))
    }

    pub(super) fn set(_path: &Path, name: &str, _value: &[u8]) -> BranchResult<()> {
        Err(BranchError::Unsupported(format!("xattr {name}")))
    }

    pub(super) fn remove(_path: &Path, name: &str) -> BranchResult<()> {
        Err(BranchError::Unsupported(format!("xattr {name}")))
    }

    pub(super) fn list(_path: &Path) -> BranchResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        (backend, dir)
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (backend, _dir) = setup();

        backend.create(Path::new("test.txt"), 0o644).await.unwrap();
        backend
            .write(Path::new("test.txt"), 0, b"hello world")
            .await
            .unwrap();

        let data = backend.read(Path::new("test.txt"), 6, 5).await.unwrap();
        assert_eq!(data, b"world");
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let (backend, _dir) = setup();
        let result = backend.create(Path::new("missing/file.txt"), 0o644).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mkdir_and_readdir() {
        let (backend, _dir) = setup();

        backend.mkdir(Path::new("subdir"), 0o755).await.unwrap();
        backend
            .create(Path::new("subdir/file.txt"), 0o644)
            .await
            .unwrap();
        backend.create(Path::new("root.txt"), 0o644).await.unwrap();

        let entries = backend.readdir(Path::new("")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root.txt", "subdir"]);
    }

    #[tokio::test]
    async fn test_read_only() {
        let (mut backend, _dir) = setup();
        backend.set_read_only(true);

        let result = backend.create(Path::new("test.txt"), 0o644).await;
        assert!(result.unwrap_err().is_read_only());
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (backend, _dir) = setup();

        let result = backend.read(Path::new("../../../etc/passwd"), 0, 100).await;
        assert!(matches!(result, Err(BranchError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_is_not_followed() {
        let (backend, _dir) = setup();

        backend.create(Path::new("target.txt"), 0o644).await.unwrap();
        backend
            .write(Path::new("target.txt"), 0, b"content")
            .await
            .unwrap();
        backend
            .symlink(Path::new("link.txt"), Path::new("target.txt"))
            .await
            .unwrap();

        let attr = backend.getattr(Path::new("link.txt")).await.unwrap();
        assert!(attr.is_symlink());
        let target = backend.readlink(Path::new("link.txt")).await.unwrap();
        assert_eq!(target, Path::new("target.txt"));
    }

    #[tokio::test]
    async fn test_rename() {
        let (backend, _dir) = setup();

        backend.create(Path::new("old.txt"), 0o644).await.unwrap();
        backend
            .write(Path::new("old.txt"), 0, b"content")
            .await
            .unwrap();
        backend
            .rename(Path::new("old.txt"), Path::new("new.txt"))
            .await
            .unwrap();

        assert!(backend.getattr(Path::new("old.txt")).await.is_err());
        let data = backend.read(Path::new("new.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"content");
    }

    #[tokio::test]
    async fn test_setattr_times_and_size() {
        let (backend, _dir) = setup();
        backend.create(Path::new("f"), 0o644).await.unwrap();
        backend.write(Path::new("f"), 0, b"hello world").await.unwrap();

        let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let attr = backend
            .setattr(
                Path::new("f"),
                SetAttr::new().with_size(5).with_mtime(mtime).with_perm(0o600),
            )
            .await
            .unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.mtime, mtime);
        assert_eq!(attr.perm, 0o600);
    }

    #[tokio::test]
    async fn test_hard_link() {
        let (backend, _dir) = setup();

        backend.create(Path::new("original.txt"), 0o644).await.unwrap();
        backend
            .write(Path::new("original.txt"), 0, b"shared content")
            .await
            .unwrap();
        backend
            .link(Path::new("original.txt"), Path::new("linked.txt"))
            .await
            .unwrap();

        let data = backend.read(Path::new("linked.txt"), 0, 100).await.unwrap();
        assert_eq!(data, b"shared content");
        let attr = backend.getattr(Path::new("original.txt")).await.unwrap();
        assert!(attr.nlink >= 2);
    }

    #[tokio::test]
    async fn test_fsync() {
        let (backend, _dir) = setup();
        backend.create(Path::new("f"), 0o644).await.unwrap();
        backend.fsync(Path::new("f")).await.unwrap();
        assert!(backend.fsync(Path::new("nope")).await.unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_statfs_reports_the_root_filesystem() {
        let (backend, _dir) = setup();
        let stats = backend.statfs().await.unwrap();
        assert!(stats.blocks > 0);
        assert!(stats.bsize > 0);
        assert!(stats.namelen > 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_user_xattrs() {
        let (backend, _dir) = setup();
        backend.create(Path::new("f"), 0o644).await.unwrap();

        // tmpfs without user_xattr support reports Unsupported; nothing to test there.
        match backend.setxattr(Path::new("f"), "user.replifs.test", b"v").await {
            Err(BranchError::Unsupported(_)) => return,
            other => other.unwrap(),
        }
        assert_eq!(
            backend.getxattr(Path::new("f"), "user.replifs.test").await.unwrap(),
            b"v"
        );
        assert!(
            backend
                .listxattr(Path::new("f"))
                .await
                .unwrap()
                .contains(&"user.replifs.test".to_string())
        );
        backend
            .removexattr(Path::new("f"), "user.replifs.test")
            .await
            .unwrap();
        assert!(matches!(
            backend.getxattr(Path::new("f"), "user.replifs.test").await,
            Err(BranchError::NoData(_))
        ));
    }
}
