//! In-memory branch filesystem.
//!
//! Used as a scratch branch and throughout the tests. All data is ephemeral.
//! Unlike a real mount it can be flipped read-only at runtime, which is how
//! tests emulate a branch that was remounted read-only.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::branch_fs::error::{BranchError, BranchResult};
use crate::branch_fs::ops::BranchOps;
use crate::branch_fs::types::{DirEntry, FileAttr, FileType, SetAttr, StatFs};

#[derive(Debug, Clone)]
enum Content {
    File(Vec<u8>),
    Directory,
    Symlink(PathBuf),
}

#[derive(Debug, Clone)]
struct Node {
    content: Content,
    attr: FileAttr,
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl Node {
    fn new(content: Content, attr: FileAttr) -> Self {
        Self {
            content,
            attr,
            xattrs: BTreeMap::new(),
        }
    }

    fn kind(&self) -> FileType {
        match self.content {
            Content::File(_) => FileType::File,
            Content::Directory => FileType::Directory,
            Content::Symlink(_) => FileType::Symlink,
        }
    }
}

/// In-memory branch filesystem.
#[derive(Debug)]
pub struct MemoryBackend {
    nodes: RwLock<HashMap<PathBuf, Node>>,
    read_only: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty filesystem holding only the root directory.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            PathBuf::new(),
            Node::new(Content::Directory, FileAttr::directory(0o755)),
        );
        Self {
            nodes: RwLock::new(nodes),
            read_only: AtomicBool::new(false),
        }
    }

    /// Toggle read-only mode; mutations fail with [`BranchError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Remove leading `/`, resolve `.` and `..`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => result.push(s),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        result
    }

    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }

    fn check_writable(&self) -> BranchResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            Err(BranchError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// The parent of `path` must exist and be a directory.
    fn check_parent(nodes: &HashMap<PathBuf, Node>, path: &Path) -> BranchResult<()> {
        let parent = path.parent().unwrap_or(Path::new(""));
        match nodes.get(parent) {
            Some(node) if node.kind().is_dir() => Ok(()),
            Some(_) => Err(BranchError::not_a_directory(Self::path_str(parent))),
            None => Err(BranchError::not_found(Self::path_str(parent))),
        }
    }

    fn insert_new(&self, path: &Path, node: Node) -> BranchResult<FileAttr> {
        self.check_writable()?;
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();
        Self::check_parent(&nodes, &normalized)?;
        if nodes.contains_key(&normalized) {
            return Err(BranchError::already_exists(Self::path_str(&normalized)));
        }
        let attr = node.attr.clone();
        nodes.insert(normalized, node);
        Ok(attr)
    }

    fn with_node<T>(&self, path: &Path, f: impl FnOnce(&Node) -> BranchResult<T>) -> BranchResult<T> {
        let normalized = Self::normalize(path);
        let nodes = self.nodes.read();
        let node = nodes
            .get(&normalized)
            .ok_or_else(|| BranchError::not_found(Self::path_str(&normalized)))?;
        f(node)
    }

    fn with_node_mut<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut Node) -> BranchResult<T>,
    ) -> BranchResult<T> {
        self.check_writable()?;
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&normalized)
            .ok_or_else(|| BranchError::not_found(Self::path_str(&normalized)))?;
        f(node)
    }
}

#[async_trait]
impl BranchOps for MemoryBackend {
    async fn getattr(&self, path: &Path) -> BranchResult<FileAttr> {
        self.with_node(path, |node| Ok(node.attr.clone()))
    }

    async fn readdir(&self, path: &Path) -> BranchResult<Vec<DirEntry>> {
        let normalized = Self::normalize(path);
        let nodes = self.nodes.read();
        match nodes.get(&normalized) {
            Some(node) if node.kind().is_dir() => {}
            Some(_) => return Err(BranchError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(BranchError::not_found(Self::path_str(&normalized))),
        }

        let mut result: Vec<DirEntry> = nodes
            .iter()
            .filter(|(p, _)| p.parent() == Some(normalized.as_path()) && **p != normalized)
            .filter_map(|(p, node)| {
                p.file_name()
                    .map(|name| DirEntry::new(name.to_string_lossy().into_owned(), node.kind()))
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> BranchResult<Vec<u8>> {
        self.with_node(path, |node| match &node.content {
            Content::File(data) => {
                let start = (offset as usize).min(data.len());
                let end = (start + size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Content::Directory => Err(BranchError::is_a_directory(Self::path_str(path))),
            Content::Symlink(_) => Err(BranchError::other("cannot read symlink as file")),
        })
    }

    async fn readlink(&self, path: &Path) -> BranchResult<PathBuf> {
        self.with_node(path, |node| match &node.content {
            Content::Symlink(target) => Ok(target.clone()),
            _ => Err(BranchError::NotASymlink(Self::path_str(path))),
        })
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> BranchResult<u32> {
        self.with_node_mut(path, |node| match &mut node.content {
            Content::File(file_data) => {
                let offset = offset as usize;
                if offset + data.len() > file_data.len() {
                    file_data.resize(offset + data.len(), 0);
                }
                file_data[offset..offset + data.len()].copy_from_slice(data);
                node.attr.size = file_data.len() as u64;
                node.attr.mtime = SystemTime::now();
                Ok(data.len() as u32)
            }
            Content::Directory => Err(BranchError::is_a_directory(Self::path_str(path))),
            Content::Symlink(_) => Err(BranchError::other("cannot write to symlink")),
        })
    }

    async fn create(&self, path: &Path, mode: u32) -> BranchResult<FileAttr> {
        self.insert_new(
            path,
            Node::new(Content::File(Vec::new()), FileAttr::file(0, mode)),
        )
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> BranchResult<FileAttr> {
        self.insert_new(path, Node::new(Content::Directory, FileAttr::directory(mode)))
    }

    async fn unlink(&self, path: &Path) -> BranchResult<()> {
        self.check_writable()?;
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();
        match nodes.get(&normalized).map(Node::kind) {
            Some(FileType::Directory) => Err(BranchError::is_a_directory(Self::path_str(&normalized))),
            Some(_) => {
                nodes.remove(&normalized);
                Ok(())
            }
            None => Err(BranchError::not_found(Self::path_str(&normalized))),
        }
    }

    async fn rmdir(&self, path: &Path) -> BranchResult<()> {
        self.check_writable()?;
        let normalized = Self::normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(BranchError::permission_denied("cannot remove root"));
        }

        let mut nodes = self.nodes.write();
        match nodes.get(&normalized).map(Node::kind) {
            Some(FileType::Directory) => {}
            Some(_) => return Err(BranchError::not_a_directory(Self::path_str(&normalized))),
            None => return Err(BranchError::not_found(Self::path_str(&normalized))),
        }
        if nodes.keys().any(|k| k.parent() == Some(normalized.as_path())) {
            return Err(BranchError::directory_not_empty(Self::path_str(&normalized)));
        }
        nodes.remove(&normalized);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> BranchResult<()> {
        self.check_writable()?;
        let from = Self::normalize(from);
        let to = Self::normalize(to);
        if from == to {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(BranchError::invalid_path(format!(
                "cannot move {} into itself",
                Self::path_str(&from)
            )));
        }

        let mut nodes = self.nodes.write();
        Self::check_parent(&nodes, &to)?;
        let source_kind = nodes
            .get(&from)
            .map(Node::kind)
            .ok_or_else(|| BranchError::not_found(Self::path_str(&from)))?;

        match nodes.get(&to).map(Node::kind) {
            Some(FileType::Directory) if !source_kind.is_dir() => {
                return Err(BranchError::is_a_directory(Self::path_str(&to)));
            }
            Some(FileType::Directory) => {
                if nodes.keys().any(|k| k.parent() == Some(to.as_path())) {
                    return Err(BranchError::directory_not_empty(Self::path_str(&to)));
                }
            }
            Some(_) if source_kind.is_dir() => {
                return Err(BranchError::not_a_directory(Self::path_str(&to)));
            }
            _ => {}
        }

        let moved: Vec<PathBuf> = nodes
            .keys()
            .filter(|k| k.starts_with(&from))
            .cloned()
            .collect();
        nodes.remove(&to);
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let suffix = old.strip_prefix(&from).unwrap_or(Path::new(""));
                let new_path = if suffix.as_os_str().is_empty() {
                    to.clone()
                } else {
                    to.join(suffix)
                };
                nodes.insert(new_path, node);
            }
        }
        Ok(())
    }

    async fn truncate(&self, path: &Path, size: u64) -> BranchResult<()> {
        self.with_node_mut(path, |node| match &mut node.content {
            Content::File(data) => {
                data.resize(size as usize, 0);
                node.attr.size = size;
                node.attr.mtime = SystemTime::now();
                Ok(())
            }
            Content::Directory => Err(BranchError::is_a_directory(Self::path_str(path))),
            Content::Symlink(_) => Err(BranchError::other("cannot truncate symlink")),
        })
    }

    async fn setattr(&self, path: &Path, set: SetAttr) -> BranchResult<FileAttr> {
        self.with_node_mut(path, |node| {
            if let (Some(size), Content::File(data)) = (set.size, &mut node.content) {
                data.resize(size as usize, 0);
                node.attr.size = size;
            }
            let attr = &mut node.attr;
            if let Some(mtime) = set.mtime {
                attr.mtime = mtime;
            }
            if let Some(atime) = set.atime {
                attr.atime = Some(atime);
            }
            if let Some(perm) = set.perm {
                attr.perm = perm;
            }
            if let Some(uid) = set.uid {
                attr.uid = Some(uid);
            }
            if let Some(gid) = set.gid {
                attr.gid = Some(gid);
            }
            Ok(attr.clone())
        })
    }

    async fn symlink(&self, path: &Path, target: &Path) -> BranchResult<FileAttr> {
        let attr = FileAttr::symlink(target.to_string_lossy().len() as u64);
        self.insert_new(path, Node::new(Content::Symlink(target.to_path_buf()), attr))
    }

    async fn link(&self, oldpath: &Path, newpath: &Path) -> BranchResult<FileAttr> {
        let _ = (oldpath, newpath);
        Err(BranchError::Unsupported(
            "hard links not supported in memory backend".into(),
        ))
    }

    async fn fsync(&self, path: &Path) -> BranchResult<()> {
        self.with_node(path, |_| Ok(()))
    }

    async fn getxattr(&self, path: &Path, name: &str) -> BranchResult<Vec<u8>> {
        self.with_node(path, |node| {
            node.xattrs
                .get(name)
                .cloned()
                .ok_or_else(|| BranchError::no_data(name))
        })
    }

    async fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> BranchResult<()> {
        self.with_node_mut(path, |node| {
            node.xattrs.insert(name.to_string(), value.to_vec());
            Ok(())
        })
    }

    async fn removexattr(&self, path: &Path, name: &str) -> BranchResult<()> {
        self.with_node_mut(path, |node| {
            node.xattrs
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| BranchError::no_data(name))
        })
    }

    async fn listxattr(&self, path: &Path) -> BranchResult<Vec<String>> {
        self.with_node(path, |node| Ok(node.xattrs.keys().cloned().collect()))
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    async fn statfs(&self) -> BranchResult<StatFs> {
        Ok(StatFs::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_read() {
        let fs = MemoryBackend::new();
        fs.create(Path::new("test.txt"), 0o644).await.unwrap();
        fs.write(Path::new("test.txt"), 0, b"hello world").await.unwrap();

        let data = fs.read(Path::new("test.txt"), 6, 5).await.unwrap();
        assert_eq!(data, b"world");
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let fs = MemoryBackend::new();
        let result = fs.create(Path::new("missing/file.txt"), 0o644).await;
        assert!(matches!(result, Err(BranchError::NotFound(_))));

        fs.mkdir(Path::new("present"), 0o755).await.unwrap();
        fs.create(Path::new("present/file.txt"), 0o644).await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdir_and_readdir() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("subdir"), 0o755).await.unwrap();
        fs.create(Path::new("subdir/file.txt"), 0o644).await.unwrap();
        fs.create(Path::new("root.txt"), 0o644).await.unwrap();

        let entries = fs.readdir(Path::new("")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root.txt", "subdir"]);

        let sub = fs.readdir(Path::new("subdir")).await.unwrap();
        assert_eq!(sub, vec![DirEntry::file("file.txt")]);
    }

    #[tokio::test]
    async fn test_rmdir_not_empty() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("nonempty"), 0o755).await.unwrap();
        fs.create(Path::new("nonempty/file.txt"), 0o644).await.unwrap();

        let result = fs.rmdir(Path::new("nonempty")).await;
        assert!(matches!(result, Err(BranchError::DirectoryNotEmpty(_))));
    }

    #[tokio::test]
    async fn test_rename_directory_moves_children() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("a"), 0o755).await.unwrap();
        fs.create(Path::new("a/f"), 0o644).await.unwrap();
        fs.write(Path::new("a/f"), 0, b"x").await.unwrap();

        fs.rename(Path::new("a"), Path::new("b")).await.unwrap();
        assert!(!fs.exists(Path::new("a")).await);
        assert_eq!(fs.read_all(Path::new("b/f")).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_xattrs() {
        let fs = MemoryBackend::new();
        fs.create(Path::new("f"), 0o644).await.unwrap();

        let missing = fs.getxattr(Path::new("f"), "user.k").await;
        assert!(matches!(missing, Err(BranchError::NoData(_))));

        fs.setxattr(Path::new("f"), "user.k", b"v").await.unwrap();
        assert_eq!(fs.getxattr(Path::new("f"), "user.k").await.unwrap(), b"v");
        assert_eq!(fs.listxattr(Path::new("f")).await.unwrap(), vec!["user.k"]);

        fs.removexattr(Path::new("f"), "user.k").await.unwrap();
        assert!(fs.listxattr(Path::new("f")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutation() {
        let fs = MemoryBackend::new();
        fs.create(Path::new("f"), 0o644).await.unwrap();
        fs.set_read_only(true);

        assert!(matches!(
            fs.write(Path::new("f"), 0, b"x").await,
            Err(BranchError::ReadOnly)
        ));
        assert!(fs.read(Path::new("f"), 0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_setattr() {
        let fs = MemoryBackend::new();
        fs.create(Path::new("f"), 0o644).await.unwrap();
        let attr = fs
            .setattr(Path::new("f"), SetAttr::new().with_perm(0o600).with_size(3))
            .await
            .unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(fs.read_all(Path::new("f")).await.unwrap(), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_path_normalization() {
        let fs = MemoryBackend::new();
        fs.mkdir(Path::new("a"), 0o755).await.unwrap();
        fs.create(Path::new("/a/c.txt"), 0o644).await.unwrap();

        assert!(fs.getattr(Path::new("a/c.txt")).await.is_ok());
        assert!(fs.getattr(Path::new("a/./c.txt")).await.is_ok());
        assert!(fs.getattr(Path::new("a/../a/c.txt")).await.is_ok());
    }
}
