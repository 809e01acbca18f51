//! Self-heal engine.
//!
//! Brings a diverged branch copy of an object back in line with a valid
//! source branch, or discards it when that is impossible. Per (object,
//! branch) the state moves `Ok → Suspect → Recovering → Ok | Discarded`.
//!
//! Callers hold the object's write lock for the duration of a heal, so a
//! heal never races a foreground operation on the same object.
//!
//! Discarding never deletes data: the branch entry is moved under
//! `.replifs/recover/` on that branch, keeping its parent path.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::branch::{Bindex, OpMask, PRIMARY};
use crate::branch_fs::{BranchError, BranchResult, FileAttr, FileType, SetAttr};
use crate::dispatch::Dispatcher;
use crate::error::{ReplicaError, ReplicaResult};
use crate::flag::{self, BranchFlag, ValidFlags};
use crate::object::{BranchHandle, HealState, ObjectBranches};
use crate::replica::ReplicaFs;

/// Hidden directory at the root of every branch.
pub const RECOVER_DIR: &str = ".replifs";

/// Where discarded entries are kept, relative to the branch root.
pub const RECOVER_PATH: &str = ".replifs/recover";

/// Chunk size for data copies.
const COPY_CHUNK: u32 = 64 * 1024;

/// How one branch's heal ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealOutcome {
    Healed,
    Discarded,
    /// The branch was already discarded.
    Skipped,
}

/// Heals objects over one branch set.
#[derive(Clone, Copy, Debug)]
pub struct Healer<'a> {
    dispatcher: Dispatcher<'a>,
}

impl<'a> Healer<'a> {
    pub fn new(dispatcher: Dispatcher<'a>) -> Self {
        Self { dispatcher }
    }

    /// Heal every suspect branch of the object at `path`.
    pub async fn heal_object(
        &self,
        path: &Path,
        state: &mut ObjectBranches,
    ) -> Vec<(Bindex, HealOutcome)> {
        let mut outcomes = Vec::new();
        for target in state.suspects() {
            let outcome = match self.heal_branch(path, state, target).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(path = %path.display(), bindex = target, error = %e, "heal failed");
                    HealOutcome::Discarded
                }
            };
            outcomes.push((target, outcome));
        }
        outcomes
    }

    /// Choose the copy a heal of `target` reads from.
    pub fn choose_source(state: &ObjectBranches, target: Bindex) -> Option<Bindex> {
        if target != PRIMARY && state.is_valid(PRIMARY, ValidFlags::DATA) {
            return Some(PRIMARY);
        }
        (0..state.bnum()).find(|b| *b != target && state.is_valid(*b, ValidFlags::DATA))
    }

    /// Heal `target`'s copy of `path`.
    ///
    /// An `Err` means the copy was discarded because healing was impossible;
    /// the error says why.
    #[tracing::instrument(skip(self, state), name = "heal.branch")]
    pub async fn heal_branch(
        &self,
        path: &Path,
        state: &mut ObjectBranches,
        target: Bindex,
    ) -> ReplicaResult<HealOutcome> {
        if state.heal[target] == HealState::Discarded {
            return Ok(HealOutcome::Skipped);
        }

        let Some(source) = Self::choose_source(state, target) else {
            self.discard(path, state, target).await;
            return Err(ReplicaError::HealUnrecoverable {
                bindex: target,
                reason: "no valid source branch".into(),
            });
        };

        let src_attr = match self
            .dispatcher
            .call(source, OpMask::READ, |b| b.ops().getattr(path))
            .await
        {
            Ok(attr) => attr,
            Err(e) => {
                self.discard(path, state, target).await;
                return Err(ReplicaError::HealUnrecoverable {
                    bindex: target,
                    reason: format!("source branch {source} unreachable: {e}"),
                });
            }
        };

        state.heal[target] = HealState::Recovering;
        tracing::debug!(source, target, "healing");

        match self.rebuild(path, state, source, target, &src_attr).await {
            Ok(handle) => {
                state.mark_ok(target, handle);
                tracing::info!(path = %path.display(), source, target, "healed");
                Ok(HealOutcome::Healed)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), target, error = %e, "heal write rejected, discarding");
                self.discard(path, state, target).await;
                Ok(HealOutcome::Discarded)
            }
        }
    }

    /// Copy the source object onto the target branch and flag it proper.
    async fn rebuild(
        &self,
        path: &Path,
        state: &mut ObjectBranches,
        source: Bindex,
        target: Bindex,
        src_attr: &FileAttr,
    ) -> BranchResult<BranchHandle> {
        let d = &self.dispatcher;

        if let Some(handle) = state.handles[target].as_mut() {
            let recovering = handle.flag.recovering();
            self.set_flag(target, path, recovering).await?;
            handle.flag = recovering;
        }

        let existing = match d.call(target, OpMask::READ, |b| b.ops().getattr(path)).await {
            Ok(attr) => Some(attr),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let mut present = match existing {
            Some(attr) if attr.kind == src_attr.kind => true,
            Some(_) => {
                self.backup(target, path).await?;
                false
            }
            None => false,
        };

        match src_attr.kind {
            FileType::File => {
                if !present {
                    d.call(target, OpMask::WRITE, |b| b.ops().create(path, src_attr.perm))
                        .await?;
                }
                self.copy_data(path, source, target, src_attr.size).await?;
            }
            FileType::Symlink => {
                let link = d.call(source, OpMask::READ, |b| b.ops().readlink(path)).await?;
                if present {
                    let current = d.call(target, OpMask::READ, |b| b.ops().readlink(path)).await?;
                    if current != link {
                        d.call(target, OpMask::WRITE, |b| b.ops().unlink(path)).await?;
                        present = false;
                    }
                }
                if !present {
                    d.call(target, OpMask::WRITE, |b| b.ops().symlink(path, &link))
                        .await?;
                }
            }
            FileType::Directory => {
                if !present {
                    d.call(target, OpMask::WRITE, |b| b.ops().mkdir(path, src_attr.perm))
                        .await?;
                }
                self.reconcile_dir(path, source, target).await?;
            }
        }

        let mirror = SetAttr::mirror(src_attr);
        d.call(target, OpMask::WRITE, |b| b.ops().setattr(path, mirror))
            .await?;
        self.copy_xattrs(path, source, target).await?;

        let flag = BranchFlag::proper(target == PRIMARY, state.raid);
        self.set_flag(target, path, flag).await?;
        Ok(BranchHandle {
            kind: src_attr.kind,
            flag,
        })
    }

    async fn set_flag(&self, bindex: Bindex, path: &Path, flag: BranchFlag) -> BranchResult<()> {
        let branch = self
            .dispatcher
            .branches()
            .get(bindex)
            .map_err(|e| BranchError::other(e.to_string()))?;
        if let Some(err) = branch.debug().injected_error(OpMask::WRITE) {
            return Err(err);
        }
        flag::set_flag(branch, path, flag).await.map_err(|e| match e {
            ReplicaError::BranchUnavailable { source, .. } => source,
            other => BranchError::other(other.to_string()),
        })
    }

    async fn copy_data(
        &self,
        path: &Path,
        source: Bindex,
        target: Bindex,
        size: u64,
    ) -> BranchResult<()> {
        let d = &self.dispatcher;
        d.call(target, OpMask::WRITE, |b| b.ops().truncate(path, 0))
            .await?;

        let mut offset = 0u64;
        while offset < size {
            let chunk = d
                .call(source, OpMask::READ, |b| b.ops().read(path, offset, COPY_CHUNK))
                .await?;
            if chunk.is_empty() {
                break;
            }
            d.call(target, OpMask::WRITE, |b| b.ops().write(path, offset, &chunk))
                .await?;
            offset += chunk.len() as u64;
        }
        Ok(())
    }

    /// Make the target's xattrs equal the source's, leaving flags alone.
    async fn copy_xattrs(&self, path: &Path, source: Bindex, target: Bindex) -> BranchResult<()> {
        let d = &self.dispatcher;
        let branches = d.branches();
        let flag_names: BTreeSet<String> = branches
            .iter()
            .map(|b| b.flag_xattr().to_string())
            .collect();

        let src_names = match d.call(source, OpMask::READ, |b| b.ops().listxattr(path)).await {
            Ok(names) => names,
            Err(BranchError::Unsupported(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let dst_names = match d.call(target, OpMask::READ, |b| b.ops().listxattr(path)).await {
            Ok(names) => names,
            Err(BranchError::Unsupported(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let wanted: BTreeSet<&String> = src_names
            .iter()
            .filter(|n| !flag_names.contains(*n))
            .collect();

        for name in &wanted {
            let value = d
                .call(source, OpMask::READ, |b| b.ops().getxattr(path, name))
                .await?;
            d.call(target, OpMask::WRITE, |b| b.ops().setxattr(path, name, &value))
                .await?;
        }

        for name in dst_names
            .iter()
            .filter(|n| !flag_names.contains(*n) && !wanted.contains(n))
        {
            d.call(target, OpMask::WRITE, |b| b.ops().removexattr(path, name))
                .await?;
        }
        Ok(())
    }

    /// Move entries the source directory lacks (or holds as a different
    /// kind) out of the target directory.
    async fn reconcile_dir(&self, path: &Path, source: Bindex, target: Bindex) -> BranchResult<()> {
        let d = &self.dispatcher;
        let src = d.call(source, OpMask::READ, |b| b.ops().readdir(path)).await?;
        let dst = d.call(target, OpMask::READ, |b| b.ops().readdir(path)).await?;
        let at_root = path.as_os_str().is_empty();

        for entry in dst {
            if at_root && entry.name == RECOVER_DIR {
                continue;
            }
            let keep = src
                .iter()
                .any(|s| s.name == entry.name && s.kind == entry.kind);
            if !keep {
                tracing::debug!(dir = %path.display(), name = %entry.name, target, "removing extra entry");
                self.backup(target, &path.join(&entry.name)).await?;
            }
        }
        Ok(())
    }

    /// Drop `target`'s copy from the object, backing up whatever is there.
    pub async fn discard(&self, path: &Path, state: &mut ObjectBranches, target: Bindex) {
        if let Err(e) = self.backup(target, path).await
            && !e.is_not_found()
        {
            tracing::warn!(path = %path.display(), target, error = %e, "backup of discarded entry failed");
        }
        state.mark_discarded(target);
        tracing::info!(path = %path.display(), target, "branch entry discarded");
    }

    /// Move `path` on `bindex` into the recover directory.
    ///
    /// Returns where the entry ended up.
    pub async fn backup(&self, bindex: Bindex, path: &Path) -> BranchResult<PathBuf> {
        let d = &self.dispatcher;
        d.call(bindex, OpMask::READ, |b| b.ops().getattr(path))
            .await?;

        let name = path
            .file_name()
            .ok_or_else(|| BranchError::invalid_path("cannot back up the root"))?
            .to_string_lossy()
            .into_owned();
        let parent = path.parent().unwrap_or(Path::new(""));
        let dir = Path::new(RECOVER_PATH).join(parent);
        self.ensure_dir(bindex, &dir).await?;

        let mut dest = dir.join(&name);
        let mut n = 1;
        while d
            .call(bindex, OpMask::READ, |b| b.ops().getattr(&dest))
            .await
            .is_ok()
        {
            dest = dir.join(format!("{name}:{n}"));
            n += 1;
        }

        d.call(bindex, OpMask::WRITE, |b| b.ops().rename(path, &dest))
            .await?;
        tracing::debug!(bindex, from = %path.display(), to = %dest.display(), "backed up entry");
        Ok(dest)
    }

    /// Create `dir` and its ancestors on `bindex`.
    pub async fn ensure_dir(&self, bindex: Bindex, dir: &Path) -> BranchResult<()> {
        let d = &self.dispatcher;
        let mut current = PathBuf::new();
        for component in dir.components() {
            current.push(component);
            let made = d
                .call(bindex, OpMask::WRITE, |b| b.ops().mkdir(&current, 0o700))
                .await;
            match made {
                Ok(_) | Err(BranchError::AlreadyExists(_)) => {}
                Err(BranchError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Deferred healing
// ============================================================================

/// Background task draining a replica's heal queue.
pub struct HealWorker {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl HealWorker {
    /// Drain `fs`'s pending heals every `period`.
    pub fn spawn(fs: Arc<ReplicaFs>, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            tracing::info!(?period, "heal worker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let healed = fs.run_pending_heals().await;
                        if healed > 0 {
                            tracing::debug!(healed, "deferred heals drained");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::info!("heal worker stopped");
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the worker and wait for its current pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "heal worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchDebug, BranchKind, BranchSet};
    use crate::branch_fs::{BranchOps, MemoryBackend};
    use crate::dispatch::DispatchPolicy;
    use crate::flag::RaidType;

    struct Fixture {
        set: BranchSet,
        backends: Vec<Arc<MemoryBackend>>,
        policy: DispatchPolicy,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            let backends: Vec<Arc<MemoryBackend>> =
                (0..n).map(|_| Arc::new(MemoryBackend::new())).collect();
            let mut builder = BranchSet::builder();
            for (i, backend) in backends.iter().enumerate() {
                builder = builder.branch(format!("/b{i}"), BranchKind::Memory, backend.clone());
            }
            Self {
                set: builder.finalize().unwrap(),
                backends,
                policy: DispatchPolicy::default(),
            }
        }

        fn healer(&self) -> Healer<'_> {
            Healer::new(Dispatcher::new(&self.set, &self.policy))
        }
    }

    fn file_handle(primary: bool) -> BranchHandle {
        BranchHandle {
            kind: FileType::File,
            flag: BranchFlag::proper(primary, RaidType::Raid1),
        }
    }

    #[tokio::test]
    async fn test_heal_copies_data_attrs_and_xattrs() {
        let fx = Fixture::new(2);
        let path = Path::new("f");
        let src = &fx.backends[0];
        src.create(path, 0o640).await.unwrap();
        src.write(path, 0, b"authoritative").await.unwrap();
        src.setxattr(path, "user.tag", b"blue").await.unwrap();

        let dst = &fx.backends[1];
        dst.create(path, 0o644).await.unwrap();
        dst.write(path, 0, b"stale data that is longer").await.unwrap();
        dst.setxattr(path, "user.old", b"x").await.unwrap();

        let mut state = ObjectBranches::new(2, RaidType::Raid1);
        state.mark_ok(0, file_handle(true));
        state.mark_ok(1, file_handle(false));
        state.mark_suspect(1);

        let outcome = fx.healer().heal_branch(path, &mut state, 1).await.unwrap();
        assert_eq!(outcome, HealOutcome::Healed);
        assert_eq!(state.heal[1], HealState::Ok);
        assert!(state.is_valid(1, ValidFlags::DATA));

        assert_eq!(dst.read_all(path).await.unwrap(), b"authoritative");
        assert_eq!(dst.getattr(path).await.unwrap().perm, 0o640);
        assert_eq!(dst.getxattr(path, "user.tag").await.unwrap(), b"blue");
        assert!(dst.getxattr(path, "user.old").await.is_err());

        let flag = flag::get_flag(fx.set.get(1).unwrap(), path).await.unwrap();
        assert!(flag.is_set() && !flag.is_databad() && !flag.is_primary());
    }

    #[tokio::test]
    async fn test_heal_recreates_missing_and_wrong_kind() {
        let fx = Fixture::new(3);
        let path = Path::new("d");
        fx.backends[0].mkdir(path, 0o750).await.unwrap();
        // branch 2 holds a file where a directory belongs
        fx.backends[2].create(path, 0o644).await.unwrap();

        let mut state = ObjectBranches::new(3, RaidType::Raid1);
        state.mark_ok(
            0,
            BranchHandle {
                kind: FileType::Directory,
                flag: BranchFlag::proper(true, RaidType::Raid1),
            },
        );
        state.mark_suspect(1);
        state.mark_suspect(2);

        let outcomes = fx.healer().heal_object(path, &mut state).await;
        assert_eq!(outcomes, vec![(1, HealOutcome::Healed), (2, HealOutcome::Healed)]);
        for backend in &fx.backends[1..] {
            assert!(backend.getattr(path).await.unwrap().is_dir());
        }
        let recovered = fx.backends[2].readdir(Path::new(RECOVER_PATH)).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].name, "d");
    }

    #[tokio::test]
    async fn test_directory_reconcile_moves_extra_entries() {
        let fx = Fixture::new(2);
        let dir = Path::new("d");
        fx.backends[0].mkdir(dir, 0o755).await.unwrap();
        fx.backends[0].create(Path::new("d/keep"), 0o644).await.unwrap();
        fx.backends[1].mkdir(dir, 0o755).await.unwrap();
        fx.backends[1].create(Path::new("d/keep"), 0o644).await.unwrap();
        fx.backends[1].create(Path::new("d/extra"), 0o644).await.unwrap();

        let mut state = ObjectBranches::new(2, RaidType::Raid1);
        state.mark_ok(
            0,
            BranchHandle {
                kind: FileType::Directory,
                flag: BranchFlag::proper(true, RaidType::Raid1),
            },
        );
        state.mark_suspect(1);

        fx.healer().heal_branch(dir, &mut state, 1).await.unwrap();
        let names: Vec<_> = fx.backends[1]
            .readdir(dir)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["keep"]);
        assert!(fx.backends[1].exists(Path::new(".replifs/recover/d/extra")).await);
    }

    #[tokio::test]
    async fn test_no_source_discards() {
        let fx = Fixture::new(2);
        let path = Path::new("orphan");
        fx.backends[1].create(path, 0o644).await.unwrap();

        let mut state = ObjectBranches::new(2, RaidType::Raid1);
        state.handles[1] = Some(file_handle(false));
        state.mark_suspect(1);

        let err = fx.healer().heal_branch(path, &mut state, 1).await.unwrap_err();
        assert!(matches!(err, ReplicaError::HealUnrecoverable { bindex: 1, .. }));
        assert_eq!(state.heal[1], HealState::Discarded);
        assert!(!fx.backends[1].exists(path).await);
        assert!(fx.backends[1].exists(Path::new(".replifs/recover/orphan")).await);
    }

    #[tokio::test]
    async fn test_rejected_write_discards() {
        let fx = Fixture::new(2);
        let path = Path::new("f");
        fx.backends[0].create(path, 0o644).await.unwrap();
        fx.backends[0].write(path, 0, b"data").await.unwrap();
        fx.set
            .get(1)
            .unwrap()
            .set_debug(BranchDebug::failing(30, OpMask::WRITE));

        let mut state = ObjectBranches::new(2, RaidType::Raid1);
        state.mark_ok(0, file_handle(true));
        state.mark_suspect(1);

        let outcome = fx.healer().heal_branch(path, &mut state, 1).await.unwrap();
        assert_eq!(outcome, HealOutcome::Discarded);
        assert_eq!(state.heal[1], HealState::Discarded);
        assert_eq!(
            fx.healer().heal_branch(path, &mut state, 1).await.unwrap(),
            HealOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_backup_collision_suffix() {
        let fx = Fixture::new(1);
        let healer = fx.healer();
        let backend = &fx.backends[0];

        backend.create(Path::new("f"), 0o644).await.unwrap();
        let first = healer.backup(0, Path::new("f")).await.unwrap();
        backend.create(Path::new("f"), 0o644).await.unwrap();
        let second = healer.backup(0, Path::new("f")).await.unwrap();
        backend.create(Path::new("f"), 0o644).await.unwrap();
        let third = healer.backup(0, Path::new("f")).await.unwrap();

        assert_eq!(first, Path::new(".replifs/recover/f"));
        assert_eq!(second, Path::new(".replifs/recover/f:1"));
        assert_eq!(third, Path::new(".replifs/recover/f:2"));
    }

    #[tokio::test]
    async fn test_heal_symlink() {
        let fx = Fixture::new(2);
        let path = Path::new("l");
        fx.backends[0].symlink(path, Path::new("target")).await.unwrap();
        fx.backends[1].symlink(path, Path::new("elsewhere")).await.unwrap();

        let mut state = ObjectBranches::new(2, RaidType::Raid1);
        state.mark_ok(
            0,
            BranchHandle {
                kind: FileType::Symlink,
                flag: BranchFlag::proper(true, RaidType::Raid1),
            },
        );
        state.mark_suspect(1);

        fx.healer().heal_branch(path, &mut state, 1).await.unwrap();
        assert_eq!(
            fx.backends[1].readlink(path).await.unwrap(),
            Path::new("target")
        );
    }
}
