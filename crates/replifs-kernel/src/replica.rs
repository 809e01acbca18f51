//! The replicated union filesystem.
//!
//! [`ReplicaFs`] presents N branches as one filesystem. Every logical
//! operation resolves a [`LogicalObject`], takes its lock, runs through the
//! [`Dispatcher`], and settles the per-branch outcomes into validity and
//! heal state. Paths are relative to the union root; a leading `/` is
//! accepted and ignored.
//!
//! Objects are cached by path for the lifetime of the mount. Discarded
//! branches stay excluded from a cached object until it is evicted by a
//! removal or rename, or the replica is unmounted.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::branch::{Bindex, Branch, BranchDebug, BranchSet, OpMask, PRIMARY};
use crate::branch_fs::{
    BranchError, BranchOps, BranchResult, DirEntry, FileAttr, FileType, SetAttr, StatFs,
};
use crate::config::{HealMode, MountConfig};
use crate::dispatch::{BranchFuture, DispatchPolicy, Dispatcher, WriteKind};
use crate::error::{ReplicaError, ReplicaResult};
use crate::flag::{self, BranchFlag, RaidType, ValidFlags};
use crate::heal::{HealOutcome, HealWorker, Healer, RECOVER_DIR, RECOVER_PATH};
use crate::object::{BranchHandle, BranchStatus, HealState, LogicalObject, ObjectBranches};
use crate::oplist::OperationList;
use crate::queue::BoundedQueue;
use crate::rule_tree::RuleTree;

/// Everything about a replica except its branches.
#[derive(Debug)]
pub struct ReplicaOptions {
    pub policy: DispatchPolicy,
    /// Per-name replication policy; `None` applies `default_raid` everywhere.
    pub rules: Option<RuleTree>,
    pub default_raid: RaidType,
    pub heal_mode: HealMode,
    pub heal_queue_size: usize,
    pub heal_interval: Duration,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            policy: DispatchPolicy::default(),
            rules: None,
            default_raid: RaidType::Raid1,
            heal_mode: HealMode::default(),
            heal_queue_size: 0,
            heal_interval: Duration::from_secs(1),
        }
    }
}

/// Administrative view of one logical object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectStatus {
    pub path: PathBuf,
    pub kind: Option<FileType>,
    pub raid: RaidType,
    pub branches: Vec<BranchStatus>,
}

/// What one branch holds at a path, as seen by a lookup.
enum Probe {
    /// The parent's copy on this branch was discarded.
    Skipped,
    Absent,
    /// `flag` is `None` when the stored flag failed validation.
    Present {
        kind: FileType,
        flag: Option<BranchFlag>,
    },
    Failed(BranchError),
}

/// A namespace entry to create.
#[derive(Clone, Copy)]
enum NewEntry<'p> {
    File(u32),
    Directory(u32),
    Symlink(&'p Path),
}

impl<'p> NewEntry<'p> {
    fn kind(&self) -> FileType {
        match self {
            NewEntry::File(_) => FileType::File,
            NewEntry::Directory(_) => FileType::Directory,
            NewEntry::Symlink(_) => FileType::Symlink,
        }
    }

    fn apply<'f>(self, branch: &'f Branch, path: &'f Path) -> BranchFuture<'f, FileAttr>
    where
        'p: 'f,
    {
        match self {
            NewEntry::File(mode) => branch.ops().create(path, mode),
            NewEntry::Directory(mode) => branch.ops().mkdir(path, mode),
            NewEntry::Symlink(target) => branch.ops().symlink(path, target),
        }
    }
}

/// Strip the root, reject `..`.
fn normalize(path: &Path) -> ReplicaResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push(name),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ReplicaError::rejected(BranchError::path_escapes_root(
                    path.display().to_string(),
                )));
            }
        }
    }
    Ok(out)
}

fn parent_of(path: &Path) -> ReplicaResult<&Path> {
    match path.parent() {
        Some(parent) if !path.as_os_str().is_empty() => Ok(parent),
        _ => Err(ReplicaError::rejected(BranchError::invalid_path(
            "the root has no parent",
        ))),
    }
}

/// The recover directory, which exists on every branch but not in the union.
fn is_reserved(path: &Path) -> bool {
    path == Path::new(RECOVER_DIR)
}

fn not_found(path: &Path) -> ReplicaError {
    ReplicaError::branch(PRIMARY, BranchError::not_found(path.display().to_string()))
}

/// A replicated union filesystem over a fixed branch set.
pub struct ReplicaFs {
    branches: BranchSet,
    options: ReplicaOptions,
    objects: DashMap<PathBuf, Arc<LogicalObject>>,
    pending: BoundedQueue<PathBuf>,
}

impl ReplicaFs {
    /// Validate `config`, open its branches and mount.
    pub async fn mount(config: &MountConfig) -> ReplicaResult<Self> {
        config.validate()?;
        Self::mount_with(config.branch_set()?, config.options()?).await
    }

    /// Mount over an already built branch set.
    pub async fn mount_with(branches: BranchSet, options: ReplicaOptions) -> ReplicaResult<Self> {
        if options.default_raid == RaidType::None {
            return Err(ReplicaError::configuration("default_raid cannot be none"));
        }

        let fs = Self {
            pending: BoundedQueue::new(options.heal_queue_size),
            branches,
            options,
            objects: DashMap::new(),
        };

        let healer = Healer::new(fs.dispatcher());
        for branch in fs.branches.iter() {
            if branch.ops().read_only() {
                tracing::warn!(bindex = branch.bindex(), path = %branch.path().display(), "branch is read-only");
                continue;
            }
            if let Err(e) = healer
                .ensure_dir(branch.bindex(), Path::new(RECOVER_PATH))
                .await
            {
                tracing::warn!(bindex = branch.bindex(), error = %e, "cannot create recover directory");
            }
        }

        let root = fs.load_root().await?;
        fs.objects.insert(PathBuf::new(), root);

        tracing::info!(
            bnum = fs.branches.len(),
            subject = %fs.options.policy.subject,
            no_abort = fs.options.policy.no_abort,
            "replica mounted"
        );
        Ok(fs)
    }

    pub fn branches(&self) -> &BranchSet {
        &self.branches
    }

    pub fn options(&self) -> &ReplicaOptions {
        &self.options
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.branches, &self.options.policy)
    }

    /// Replication policy a new object named like `path` gets.
    pub fn policy_for(&self, path: &Path) -> RaidType {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        self.options
            .rules
            .as_ref()
            .map_or(self.options.default_raid, |tree| tree.search(&name))
    }

    fn is_flag_xattr(&self, name: &str) -> bool {
        self.branches.iter().any(|b| b.flag_xattr() == name)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Resolve `path` to its logical object, loading it if needed.
    #[tracing::instrument(skip(self), name = "replica.lookup")]
    pub async fn lookup(&self, path: &Path) -> ReplicaResult<Arc<LogicalObject>> {
        let path = normalize(path)?;
        self.resolve(&path).await
    }

    fn cached(&self, path: &Path) -> Option<Arc<LogicalObject>> {
        self.objects.get(path).map(|entry| entry.value().clone())
    }

    async fn resolve(&self, path: &Path) -> ReplicaResult<Arc<LogicalObject>> {
        if let Some(obj) = self.cached(path) {
            self.recheck(&obj).await;
            return Ok(obj);
        }

        let mut current = match self.cached(Path::new("")) {
            Some(root) => root,
            None => {
                let root = self.load_root().await?;
                self.objects
                    .entry(PathBuf::new())
                    .or_insert(root)
                    .value()
                    .clone()
            }
        };

        let mut walked = PathBuf::new();
        for component in path.components() {
            walked.push(component);
            current = match self.cached(&walked) {
                Some(obj) => obj,
                None => self.load(&current, &walked).await?,
            };
        }
        Ok(current)
    }

    async fn load_root(&self) -> ReplicaResult<Arc<LogicalObject>> {
        let root = Path::new("");
        let bnum = self.branches.len();

        let mut probes = Vec::with_capacity(bnum);
        for bindex in 0..bnum {
            probes.push(self.probe(bindex, root).await);
        }
        if !probes.iter().any(|p| matches!(p, Probe::Present { .. })) {
            return Err(ReplicaError::no_branch(root));
        }

        let state = Self::classify(RaidType::Raid1, Some(FileType::Directory), probes, &vec![true; bnum]);
        for bindex in state.suspects() {
            tracing::warn!(bindex, "branch root is not current");
        }
        Ok(Arc::new(LogicalObject::new(root, state)))
    }

    async fn load(
        &self,
        parent: &LogicalObject,
        path: &Path,
    ) -> ReplicaResult<Arc<LogicalObject>> {
        if is_reserved(path) {
            return Err(ReplicaError::rejected(BranchError::not_found(RECOVER_DIR)));
        }

        let state = {
            let parent_state = parent.read().await;
            if parent_state.kind() != Some(FileType::Directory) {
                return Err(ReplicaError::rejected(BranchError::not_a_directory(
                    parent.path().display().to_string(),
                )));
            }
            self.load_child(&parent_state, path).await?
        };

        let has_suspects = !state.suspects().is_empty();
        let obj = Arc::new(LogicalObject::new(path, state));
        let obj = self
            .objects
            .entry(path.to_path_buf())
            .or_insert(obj)
            .value()
            .clone();
        if has_suspects {
            self.schedule_heal(&obj).await;
        }
        Ok(obj)
    }

    /// Build the branch state of `path` from what every branch holds.
    ///
    /// A branch is latest for the child when its copy of the parent has
    /// DATA validity. The object exists iff some latest branch holds it;
    /// copies found only on stale branches are moved to the recover
    /// directory.
    async fn load_child(&self, parent: &ObjectBranches, path: &Path) -> ReplicaResult<ObjectBranches> {
        let bnum = self.branches.len();
        let mut latest: Vec<bool> = (0..bnum)
            .map(|b| parent.is_valid(b, ValidFlags::DATA))
            .collect();
        if !latest.contains(&true) {
            latest = (0..bnum)
                .map(|b| parent.heal[b] != HealState::Discarded)
                .collect();
        }

        let mut probes = Vec::with_capacity(bnum);
        for bindex in 0..bnum {
            let probe = if parent.heal[bindex] == HealState::Discarded {
                Probe::Skipped
            } else {
                self.probe(bindex, path).await
            };
            probes.push(probe);
        }

        let kind = probes
            .iter()
            .zip(&latest)
            .find_map(|(probe, latest)| match probe {
                Probe::Present { kind, .. } if *latest => Some(*kind),
                _ => None,
            });

        let Some(kind) = kind else {
            let failed = (0..bnum).find(|b| latest[*b] && matches!(probes[*b], Probe::Failed(_)));
            if let Some(bindex) = failed
                && let Probe::Failed(e) = probes.swap_remove(bindex)
            {
                return Err(ReplicaError::branch(bindex, e));
            }

            let healer = Healer::new(self.dispatcher());
            for (bindex, probe) in probes.iter().enumerate() {
                if matches!(probe, Probe::Present { .. }) {
                    tracing::info!(bindex, path = %path.display(), "discarding entry found only on a stale branch");
                    if let Err(e) = healer.backup(bindex, path).await {
                        tracing::warn!(bindex, error = %e, "stale entry backup failed");
                    }
                }
            }
            return Err(not_found(path));
        };

        let stored = match &probes[PRIMARY] {
            Probe::Present {
                flag: Some(flag), ..
            } => flag.raid().filter(|r| *r != RaidType::None),
            _ => None,
        };
        let raid = match kind {
            FileType::Directory => RaidType::Raid1,
            _ => stored.unwrap_or_else(|| self.policy_for(path)),
        };
        Ok(Self::classify(raid, Some(kind), probes, &latest))
    }

    async fn probe(&self, bindex: Bindex, path: &Path) -> Probe {
        let attr = match self
            .dispatcher()
            .call(bindex, OpMask::READ, |b| b.ops().getattr(path))
            .await
        {
            Ok(attr) => attr,
            Err(e) if e.is_not_found() => return Probe::Absent,
            Err(e) => return Probe::Failed(e),
        };

        let loaded = match self.branches.get(bindex) {
            Ok(branch) => flag::get_flag(branch, path).await,
            Err(e) => Err(e),
        };
        let flag = match loaded {
            Ok(flag) => Some(flag),
            Err(e) if matches!(e.branch_error(), Some(BranchError::Unsupported(_))) => {
                Some(BranchFlag::UNSET)
            }
            Err(e) => {
                tracing::warn!(bindex, path = %path.display(), error = %e, "untrusted flag, treating copy as data-bad");
                None
            }
        };
        Probe::Present {
            kind: attr.kind,
            flag,
        }
    }

    fn classify(
        raid: RaidType,
        kind: Option<FileType>,
        probes: Vec<Probe>,
        latest: &[bool],
    ) -> ObjectBranches {
        let mut state = ObjectBranches::new(probes.len(), raid);
        for (bindex, probe) in probes.into_iter().enumerate() {
            match probe {
                Probe::Skipped => state.mark_discarded(bindex),
                Probe::Present { kind: found, flag } => {
                    let handle = BranchHandle {
                        kind: found,
                        flag: flag.unwrap_or(BranchFlag::UNSET),
                    };
                    let healthy = latest[bindex]
                        && Some(found) == kind
                        && flag.is_some_and(|f| !f.is_databad() && !f.is_recovering());
                    if healthy {
                        state.mark_ok(bindex, handle);
                    } else {
                        state.handles[bindex] = Some(handle);
                        state.validity[bindex] = ValidFlags::BRANCH;
                        if state.expects_copy(bindex) {
                            state.mark_suspect(bindex);
                        }
                    }
                }
                Probe::Absent | Probe::Failed(_) => {
                    if state.expects_copy(bindex) {
                        state.mark_suspect(bindex);
                    } else {
                        state.mark_absent(bindex);
                    }
                }
            }
        }
        state
    }

    /// Drop `path` and everything cached below it.
    fn evict(&self, path: &Path) {
        if path.as_os_str().is_empty() {
            return;
        }
        self.objects.retain(|cached, _| !cached.starts_with(path));
    }

    // ========================================================================
    // Read-style operations
    // ========================================================================

    async fn read_op<'s, 'f, T, F>(
        &'s self,
        path: &'f Path,
        mask: ValidFlags,
        keep_order: bool,
        op: F,
    ) -> ReplicaResult<T>
    where
        's: 'f,
        F: FnMut(&'s Branch) -> BranchFuture<'f, T>,
    {
        let obj = self.resolve(path).await?;
        let state = obj.read().await;
        let (_, value) = self
            .dispatcher()
            .read(&state, path, mask, keep_order, op)
            .await?;
        Ok(value)
    }

    #[tracing::instrument(skip(self), name = "replica.getattr")]
    pub async fn getattr(&self, path: &Path) -> ReplicaResult<FileAttr> {
        let path = normalize(path)?;
        self.read_op(&path, ValidFlags::ATTR, false, |b| b.ops().getattr(&path))
            .await
    }

    /// Directory listing from the first current branch.
    #[tracing::instrument(skip(self), name = "replica.readdir")]
    pub async fn readdir(&self, path: &Path) -> ReplicaResult<Vec<DirEntry>> {
        let path = normalize(path)?;
        let mut entries = self
            .read_op(&path, ValidFlags::DATA, true, |b| b.ops().readdir(&path))
            .await?;
        if path.as_os_str().is_empty() {
            entries.retain(|e| e.name != RECOVER_DIR);
        }
        Ok(entries)
    }

    #[tracing::instrument(skip(self), name = "replica.read")]
    pub async fn read(&self, path: &Path, offset: u64, size: u32) -> ReplicaResult<Vec<u8>> {
        let path = normalize(path)?;
        self.read_op(&path, ValidFlags::DATA, false, |b| {
            b.ops().read(&path, offset, size)
        })
        .await
    }

    pub async fn readlink(&self, path: &Path) -> ReplicaResult<PathBuf> {
        let path = normalize(path)?;
        self.read_op(&path, ValidFlags::DATA, false, |b| b.ops().readlink(&path))
            .await
    }

    /// Flag xattrs are invisible through the union.
    pub async fn getxattr(&self, path: &Path, name: &str) -> ReplicaResult<Vec<u8>> {
        if self.is_flag_xattr(name) {
            return Err(ReplicaError::rejected(BranchError::no_data(name)));
        }
        let path = normalize(path)?;
        self.read_op(&path, ValidFlags::XATTR, false, |b| {
            b.ops().getxattr(&path, name)
        })
        .await
    }

    pub async fn listxattr(&self, path: &Path) -> ReplicaResult<Vec<String>> {
        let path = normalize(path)?;
        let mut names = self
            .read_op(&path, ValidFlags::XATTR, false, |b| b.ops().listxattr(&path))
            .await?;
        names.retain(|n| !self.is_flag_xattr(n));
        Ok(names)
    }

    /// Capacity of the smallest reachable branch.
    pub async fn statfs(&self) -> ReplicaResult<StatFs> {
        let d = self.dispatcher();
        let discarded: Vec<bool> = match self.cached(Path::new("")) {
            Some(root) => root
                .read()
                .await
                .heal
                .iter()
                .map(|h| *h == HealState::Discarded)
                .collect(),
            None => vec![false; self.branches.len()],
        };

        let mut merged: Option<StatFs> = None;
        let mut first_error = None;
        for branch in self.branches.iter() {
            let bindex = branch.bindex();
            if discarded[bindex] {
                continue;
            }
            match d.call(bindex, OpMask::READ, |b| b.ops().statfs()).await {
                Ok(stats) => {
                    merged = Some(match merged {
                        Some(current) => current.narrow(&stats),
                        None => stats,
                    });
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(ReplicaError::branch(bindex, e));
                    }
                }
            }
        }
        match (merged, first_error) {
            (Some(stats), _) => Ok(stats),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ReplicaError::no_branch("")),
        }
    }

    // ========================================================================
    // Content writes
    // ========================================================================

    async fn content_op<'s, 'f, T, F>(
        &'s self,
        path: &'f Path,
        kind: WriteKind,
        data: bool,
        op: F,
    ) -> ReplicaResult<T>
    where
        's: 'f,
        F: FnMut(&'s Branch) -> BranchFuture<'f, T>,
    {
        let obj = self.resolve(path).await?;
        let d = self.dispatcher();

        let (result, suspects) = if data {
            let _content = obj.lock_content().await;
            let list = {
                let state = obj.read().await;
                d.write(&state, path, kind, op).await?
            };
            let mut state = obj.write().await;
            d.settle(&mut state, path, kind, list).await
        } else {
            let mut state = obj.write().await;
            let list = d.write(&state, path, kind, op).await?;
            d.settle(&mut state, path, kind, list).await
        };

        if !suspects.is_empty() {
            self.schedule_heal(&obj).await;
        }
        result
    }

    #[tracing::instrument(skip(self, data), fields(len = data.len()), name = "replica.write")]
    pub async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> ReplicaResult<u32> {
        let path = normalize(path)?;
        self.content_op(&path, WriteKind::Content, true, |b| {
            b.ops().write(&path, offset, data)
        })
        .await
    }

    #[tracing::instrument(skip(self), name = "replica.truncate")]
    pub async fn truncate(&self, path: &Path, size: u64) -> ReplicaResult<()> {
        let path = normalize(path)?;
        self.content_op(&path, WriteKind::Content, true, |b| {
            b.ops().truncate(&path, size)
        })
        .await
    }

    #[tracing::instrument(skip(self), name = "replica.setattr")]
    pub async fn setattr(&self, path: &Path, attr: SetAttr) -> ReplicaResult<FileAttr> {
        let path = normalize(path)?;
        let data = attr.size.is_some();
        self.content_op(&path, WriteKind::Content, data, |b| {
            b.ops().setattr(&path, attr.clone())
        })
        .await
    }

    #[tracing::instrument(skip(self, value), name = "replica.setxattr")]
    pub async fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> ReplicaResult<()> {
        if self.is_flag_xattr(name) {
            return Err(ReplicaError::rejected(BranchError::permission_denied(name)));
        }
        let path = normalize(path)?;
        self.content_op(&path, WriteKind::Content, false, |b| {
            b.ops().setxattr(&path, name, value)
        })
        .await
    }

    pub async fn removexattr(&self, path: &Path, name: &str) -> ReplicaResult<()> {
        if self.is_flag_xattr(name) {
            return Err(ReplicaError::rejected(BranchError::permission_denied(name)));
        }
        let path = normalize(path)?;
        self.content_op(&path, WriteKind::Content, false, |b| {
            b.ops().removexattr(&path, name)
        })
        .await
    }

    pub async fn fsync(&self, path: &Path) -> ReplicaResult<()> {
        let path = normalize(path)?;
        self.content_op(&path, WriteKind::Namespace, false, |b| b.ops().fsync(&path))
            .await
    }

    // ========================================================================
    // Namespace writes
    // ========================================================================

    #[tracing::instrument(skip(self), name = "replica.create")]
    pub async fn create(&self, path: &Path, mode: u32) -> ReplicaResult<FileAttr> {
        self.create_entry(path, NewEntry::File(mode)).await
    }

    #[tracing::instrument(skip(self), name = "replica.mkdir")]
    pub async fn mkdir(&self, path: &Path, mode: u32) -> ReplicaResult<FileAttr> {
        self.create_entry(path, NewEntry::Directory(mode)).await
    }

    #[tracing::instrument(skip(self), name = "replica.symlink")]
    pub async fn symlink(&self, path: &Path, target: &Path) -> ReplicaResult<FileAttr> {
        self.create_entry(path, NewEntry::Symlink(target)).await
    }

    async fn create_entry(&self, path: &Path, entry: NewEntry<'_>) -> ReplicaResult<FileAttr> {
        let path = normalize(path)?;
        let parent_path = parent_of(&path)?;
        if is_reserved(&path) {
            return Err(ReplicaError::rejected(BranchError::permission_denied(RECOVER_DIR)));
        }
        let parent = self.resolve(parent_path).await?;
        let d = self.dispatcher();

        let parent_state = parent.write().await;
        if parent_state.kind() != Some(FileType::Directory) {
            return Err(ReplicaError::rejected(BranchError::not_a_directory(
                parent_path.display().to_string(),
            )));
        }

        let raid = match entry.kind() {
            FileType::Directory => RaidType::Raid1,
            _ => self.policy_for(&path),
        };
        let mut state = ObjectBranches::new(self.branches.len(), raid);
        for bindex in 0..state.bnum() {
            if parent_state.heal[bindex] == HealState::Discarded {
                state.mark_discarded(bindex);
            } else if state.expects_copy(bindex) {
                state.validity[bindex] = parent_state.validity[bindex];
            }
        }

        let list = d
            .write(&state, &path, WriteKind::Namespace, |b| entry.apply(b, &path))
            .await?;

        if !list.consensus().is_success() {
            let created = list.succeeded();
            let result = list.into_result();
            self.roll_back(&path, entry.kind(), &created).await;
            return result;
        }

        for bindex in list.succeeded() {
            let flag = BranchFlag::proper(bindex == PRIMARY, raid);
            self.store_flag(bindex, &path, flag).await;
            state.mark_ok(
                bindex,
                BranchHandle {
                    kind: entry.kind(),
                    flag,
                },
            );
        }
        let (result, suspects) = d.settle(&mut state, &path, WriteKind::Namespace, list).await;

        let obj = Arc::new(LogicalObject::new(&path, state));
        self.evict(&path);
        self.objects.insert(path.clone(), obj.clone());
        drop(parent_state);

        if !suspects.is_empty() {
            self.schedule_heal(&obj).await;
        }
        result
    }

    /// Persist a flag outside a heal; failure only costs a later heal.
    async fn store_flag(&self, bindex: Bindex, path: &Path, flag: BranchFlag) {
        let Ok(branch) = self.branches.get(bindex) else {
            return;
        };
        match flag::set_flag(branch, path, flag).await {
            Ok(()) => {}
            Err(e) if matches!(e.branch_error(), Some(BranchError::Unsupported(_))) => {
                tracing::debug!(bindex, "branch cannot store flags");
            }
            Err(e) => tracing::warn!(bindex, path = %path.display(), error = %e, "failed to store flag"),
        }
    }

    /// Undo a create that lost consensus on the branches where it landed.
    async fn roll_back(&self, path: &Path, kind: FileType, created: &[Bindex]) {
        let d = self.dispatcher();
        for &bindex in created {
            let undone = if kind.is_dir() {
                d.call(bindex, OpMask::WRITE, |b| b.ops().rmdir(path)).await
            } else {
                d.call(bindex, OpMask::WRITE, |b| b.ops().unlink(path)).await
            };
            if let Err(e) = undone {
                tracing::warn!(bindex, path = %path.display(), error = %e, "rollback of failed create left an entry behind");
            }
        }
    }

    #[tracing::instrument(skip(self), name = "replica.unlink")]
    pub async fn unlink(&self, path: &Path) -> ReplicaResult<()> {
        self.remove_entry(path, false).await
    }

    #[tracing::instrument(skip(self), name = "replica.rmdir")]
    pub async fn rmdir(&self, path: &Path) -> ReplicaResult<()> {
        self.remove_entry(path, true).await
    }

    async fn remove_entry(&self, path: &Path, dir: bool) -> ReplicaResult<()> {
        let path = normalize(path)?;
        let parent_path = parent_of(&path)?;
        let parent = self.resolve(parent_path).await?;
        let obj = self.resolve(&path).await?;
        let d = self.dispatcher();

        let mut parent_state = parent.write().await;
        let mut state = obj.write().await;
        match (state.kind(), dir) {
            (Some(FileType::Directory), false) => {
                return Err(ReplicaError::rejected(BranchError::is_a_directory(
                    path.display().to_string(),
                )));
            }
            (Some(kind), true) if !kind.is_dir() => {
                return Err(ReplicaError::rejected(BranchError::not_a_directory(
                    path.display().to_string(),
                )));
            }
            _ => {}
        }

        let absent: Vec<bool> = state.handles.iter().map(Option::is_none).collect();
        let target: &Path = &path;
        let list: OperationList<()> = d
            .write(&state, target, WriteKind::Namespace, |b| {
                let absent = absent[b.bindex()];
                Box::pin(async move {
                    let outcome = if dir {
                        b.ops().rmdir(target).await
                    } else {
                        b.ops().unlink(target).await
                    };
                    match outcome {
                        Err(e) if absent && e.is_not_found() => Ok(()),
                        other => other,
                    }
                })
            })
            .await?;
        let (result, divergent) = d.settle(&mut state, target, WriteKind::Namespace, list).await;

        if result.is_err() {
            drop(state);
            drop(parent_state);
            if !divergent.is_empty() {
                self.schedule_heal(&obj).await;
            }
            return result;
        }

        // Branches that still hold the entry have a stale parent.
        let stale: Vec<Bindex> = divergent
            .into_iter()
            .filter(|b| state.handles[*b].is_some())
            .collect();
        parent_state
            .mark_divergent(&self.branches, parent_path, &stale)
            .await;
        drop(state);
        drop(parent_state);

        self.evict(&path);
        if !stale.is_empty() {
            self.schedule_heal(&parent).await;
        }
        result
    }

    /// Rename `from` to `to`, replacing whatever `to` names.
    #[tracing::instrument(skip(self), name = "replica.rename")]
    pub async fn rename(&self, from: &Path, to: &Path) -> ReplicaResult<()> {
        let from = normalize(from)?;
        let to = normalize(to)?;
        if from == to {
            return Ok(());
        }
        if is_reserved(&to) {
            return Err(ReplicaError::rejected(BranchError::permission_denied(RECOVER_DIR)));
        }
        if to.starts_with(&from) {
            return Err(ReplicaError::rejected(BranchError::invalid_path(format!(
                "cannot move {} into itself",
                from.display()
            ))));
        }
        let from_parent = parent_of(&from)?;
        let to_parent = parent_of(&to)?;

        let obj = self.resolve(&from).await?;
        let mut objects = vec![
            self.resolve(from_parent).await?,
            self.resolve(to_parent).await?,
            obj.clone(),
        ];
        match self.resolve(&to).await {
            Ok(replaced) => objects.push(replaced),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // Ancestors sort before descendants, so locking in path order never
        // inverts the parent-then-child order other operations use.
        objects.sort_by(|a, b| a.path().cmp(b.path()));
        objects.dedup_by(|a, b| a.path() == b.path());
        let mut guards = Vec::with_capacity(objects.len());
        for object in &objects {
            guards.push(object.write().await);
        }
        let index = |path: &Path| objects.iter().position(|o| o.path() == path);
        let (Some(oi), Some(si), Some(ti)) = (index(&from), index(from_parent), index(to_parent))
        else {
            return Err(not_found(&from));
        };

        let d = self.dispatcher();
        let absent: Vec<bool> = guards[oi].handles.iter().map(Option::is_none).collect();
        let src: &Path = &from;
        let dst: &Path = &to;
        let list: OperationList<()> = d
            .write(&guards[oi], src, WriteKind::Namespace, |b| {
                let absent = absent[b.bindex()];
                Box::pin(async move {
                    match b.ops().rename(src, dst).await {
                        Err(e) if absent && e.is_not_found() => Ok(()),
                        other => other,
                    }
                })
            })
            .await?;
        let (result, divergent) = d.settle(&mut guards[oi], src, WriteKind::Namespace, list).await;
        if result.is_err() {
            drop(guards);
            if !divergent.is_empty() {
                self.schedule_heal(&obj).await;
            }
            return result;
        }

        let stale: Vec<Bindex> = divergent
            .iter()
            .copied()
            .filter(|b| guards[oi].handles[*b].is_some())
            .collect();
        guards[si]
            .mark_divergent(&self.branches, from_parent, &stale)
            .await;
        if ti != si {
            guards[ti]
                .mark_divergent(&self.branches, to_parent, &stale)
                .await;
        }
        let moved = ObjectBranches::clone(&guards[oi]);
        drop(guards);

        let needs_heal = !moved.suspects().is_empty();
        self.evict(&from);
        self.evict(&to);
        self.pending.remove_data(&from);
        let renamed = Arc::new(LogicalObject::new(&to, moved));
        self.objects.insert(to.clone(), renamed.clone());

        if !stale.is_empty()
            && let Some(parent) = self.cached(from_parent)
        {
            self.schedule_heal(&parent).await;
        }
        if needs_heal {
            self.schedule_heal(&renamed).await;
        }
        result
    }

    /// Hard link `newpath` to `oldpath`.
    #[tracing::instrument(skip(self), name = "replica.link")]
    pub async fn link(&self, oldpath: &Path, newpath: &Path) -> ReplicaResult<FileAttr> {
        let oldpath = normalize(oldpath)?;
        let newpath = normalize(newpath)?;
        if is_reserved(&newpath) {
            return Err(ReplicaError::rejected(BranchError::permission_denied(RECOVER_DIR)));
        }
        let parent = self.resolve(parent_of(&newpath)?).await?;
        let obj = self.resolve(&oldpath).await?;

        let snapshot = ObjectBranches::clone(&*obj.read().await);
        if snapshot.kind() == Some(FileType::Directory) {
            return Err(ReplicaError::rejected(BranchError::is_a_directory(
                oldpath.display().to_string(),
            )));
        }

        let _parent_state = parent.write().await;
        let d = self.dispatcher();
        let list = d
            .write(&snapshot, &newpath, WriteKind::Namespace, |b| {
                b.ops().link(&oldpath, &newpath)
            })
            .await?;
        if !list.consensus().is_success() {
            let created = list.succeeded();
            let result = list.into_result();
            self.roll_back(&newpath, FileType::File, &created).await;
            return result;
        }

        // Rebuilt by the next lookup; missing links heal as copies.
        self.evict(&newpath);
        list.into_result()
    }

    // ========================================================================
    // Healing and administration
    // ========================================================================

    /// Per-branch state of the object at `path`.
    pub async fn status(&self, path: &Path) -> ReplicaResult<ObjectStatus> {
        let path = normalize(path)?;
        let obj = self.resolve(&path).await?;
        let state = obj.read().await;
        Ok(ObjectStatus {
            path,
            kind: state.kind(),
            raid: state.raid,
            branches: state.status(),
        })
    }

    /// Heal `path` now, after any suspect ancestor.
    #[tracing::instrument(skip(self), name = "replica.heal")]
    pub async fn heal(&self, path: &Path) -> ReplicaResult<Vec<(Bindex, HealOutcome)>> {
        let path = normalize(path)?;
        self.resolve(&path).await?;
        self.pending.remove_data(&path);
        Ok(self.heal_cached(&path).await)
    }

    /// Heal every queued object. Returns how many branch copies were healed.
    pub async fn run_pending_heals(&self) -> usize {
        let mut healed = 0;
        while let Some(path) = self.pending.remove() {
            healed += self
                .heal_cached(&path)
                .await
                .iter()
                .filter(|(_, outcome)| *outcome == HealOutcome::Healed)
                .count();
        }
        healed
    }

    pub fn pending_heals(&self) -> usize {
        self.pending.len()
    }

    /// Drain the heal queue every `heal_interval` in the background.
    pub fn spawn_heal_worker(self: &Arc<Self>) -> HealWorker {
        HealWorker::spawn(Arc::clone(self), self.options.heal_interval)
    }

    /// Queue a cached object again when it still has suspect copies but
    /// no pending heal.
    async fn recheck(&self, obj: &LogicalObject) {
        if self.options.heal_mode != HealMode::Deferred || self.pending.contains(&obj.path().to_path_buf()) {
            return;
        }
        if obj.read().await.suspects().is_empty() {
            return;
        }
        tracing::debug!(path = %obj.path().display(), "suspect object re-queued on access");
        self.schedule_heal(obj).await;
    }

    async fn schedule_heal(&self, obj: &LogicalObject) {
        match self.options.heal_mode {
            HealMode::Inline => {
                self.heal_cached(obj.path()).await;
            }
            HealMode::Deferred => {
                let path = obj.path().to_path_buf();
                if self.pending.contains(&path) {
                    return;
                }
                if let Err(path) = self.pending.push(path) {
                    tracing::warn!(path = %path.display(), "heal queue full, healing inline");
                    self.heal_cached(&path).await;
                }
            }
            HealMode::Off => {
                tracing::debug!(path = %obj.path().display(), "suspect branches left for an explicit heal");
            }
        }
    }

    /// Heal the cached ancestors of `path` that need it, then `path`.
    async fn heal_cached(&self, path: &Path) -> Vec<(Bindex, HealOutcome)> {
        let mut prefixes = vec![PathBuf::new()];
        let mut walked = PathBuf::new();
        for component in path.components() {
            walked.push(component);
            prefixes.push(walked.clone());
        }

        let mut outcomes = Vec::new();
        for prefix in prefixes {
            let Some(obj) = self.cached(&prefix) else {
                continue;
            };
            if obj.read().await.suspects().is_empty() {
                continue;
            }
            let mut state = obj.write().await;
            let healed = Healer::new(self.dispatcher())
                .heal_object(obj.path(), &mut state)
                .await;
            if prefix == path {
                outcomes = healed;
            }
        }
        outcomes
    }

    pub fn branch_debug(&self, bindex: Bindex) -> ReplicaResult<BranchDebug> {
        Ok(self.branches.get(bindex)?.debug())
    }

    /// Arm or clear fault injection on one branch.
    pub fn set_branch_debug(&self, bindex: Bindex, fault: BranchDebug) -> ReplicaResult<()> {
        self.branches.get(bindex)?.set_debug(fault);
        tracing::info!(bindex, active = fault.active, errno = fault.errno, mask = ?fault.mask, "branch debug updated");
        Ok(())
    }

    /// Finish queued heals and drop every cached object.
    ///
    /// Returns the number of branch copies healed on the way out.
    pub async fn unmount(&self) -> usize {
        let healed = self.run_pending_heals().await;
        let cached = self.objects.len();
        self.objects.clear();
        tracing::info!(healed, cached, "replica unmounted");
        healed
    }
}

// ============================================================================
// Stacking
// ============================================================================

#[async_trait]
impl BranchOps for ReplicaFs {
    async fn getattr(&self, path: &Path) -> BranchResult<FileAttr> {
        Ok(ReplicaFs::getattr(self, path).await?)
    }

    async fn readdir(&self, path: &Path) -> BranchResult<Vec<DirEntry>> {
        Ok(ReplicaFs::readdir(self, path).await?)
    }

    async fn read(&self, path: &Path, offset: u64, size: u32) -> BranchResult<Vec<u8>> {
        Ok(ReplicaFs::read(self, path, offset, size).await?)
    }

    async fn readlink(&self, path: &Path) -> BranchResult<PathBuf> {
        Ok(ReplicaFs::readlink(self, path).await?)
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> BranchResult<u32> {
        Ok(ReplicaFs::write(self, path, offset, data).await?)
    }

    async fn create(&self, path: &Path, mode: u32) -> BranchResult<FileAttr> {
        Ok(ReplicaFs::create(self, path, mode).await?)
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> BranchResult<FileAttr> {
        Ok(ReplicaFs::mkdir(self, path, mode).await?)
    }

    async fn unlink(&self, path: &Path) -> BranchResult<()> {
        Ok(ReplicaFs::unlink(self, path).await?)
    }

    async fn rmdir(&self, path: &Path) -> BranchResult<()> {
        Ok(ReplicaFs::rmdir(self, path).await?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> BranchResult<()> {
        Ok(ReplicaFs::rename(self, from, to).await?)
    }

    async fn truncate(&self, path: &Path, size: u64) -> BranchResult<()> {
        Ok(ReplicaFs::truncate(self, path, size).await?)
    }

    async fn setattr(&self, path: &Path, attr: SetAttr) -> BranchResult<FileAttr> {
        Ok(ReplicaFs::setattr(self, path, attr).await?)
    }

    async fn symlink(&self, path: &Path, target: &Path) -> BranchResult<FileAttr> {
        Ok(ReplicaFs::symlink(self, path, target).await?)
    }

    async fn link(&self, oldpath: &Path, newpath: &Path) -> BranchResult<FileAttr> {
        Ok(ReplicaFs::link(self, oldpath, newpath).await?)
    }

    async fn fsync(&self, path: &Path) -> BranchResult<()> {
        Ok(ReplicaFs::fsync(self, path).await?)
    }

    async fn getxattr(&self, path: &Path, name: &str) -> BranchResult<Vec<u8>> {
        Ok(ReplicaFs::getxattr(self, path, name).await?)
    }

    async fn setxattr(&self, path: &Path, name: &str, value: &[u8]) -> BranchResult<()> {
        Ok(ReplicaFs::setxattr(self, path, name, value).await?)
    }

    async fn removexattr(&self, path: &Path, name: &str) -> BranchResult<()> {
        Ok(ReplicaFs::removexattr(self, path, name).await?)
    }

    async fn listxattr(&self, path: &Path) -> BranchResult<Vec<String>> {
        Ok(ReplicaFs::listxattr(self, path).await?)
    }

    fn read_only(&self) -> bool {
        self.branches.primary().ops().read_only()
    }

    async fn statfs(&self) -> BranchResult<StatFs> {
        Ok(ReplicaFs::statfs(self).await?)
    }
}
