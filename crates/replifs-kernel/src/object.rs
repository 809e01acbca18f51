//! Logical objects: the union-level view of one path across all branches.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::branch::{Bindex, BranchSet};
use crate::branch_fs::FileType;
use crate::error::{ReplicaError, ReplicaResult};
use crate::flag::{self, BranchFlag, RaidType, ValidFlags};
use crate::oplist::OperationList;

/// Heal progress of one (object, branch) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealState {
    Ok,
    /// Diverged; waiting for a heal.
    Suspect,
    Recovering,
    /// Dropped from this object; not dispatched to again.
    Discarded,
}

impl HealState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealState::Ok => "ok",
            HealState::Suspect => "suspect",
            HealState::Recovering => "recovering",
            HealState::Discarded => "discarded",
        }
    }
}

impl std::fmt::Display for HealState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the replica knows about one branch's copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchHandle {
    pub kind: FileType,
    pub flag: BranchFlag,
}

/// Branch state of an object, guarded by the object's rwlock.
#[derive(Debug, Clone)]
pub struct ObjectBranches {
    /// `None` where the branch lacks the object.
    pub handles: Vec<Option<BranchHandle>>,
    pub validity: Vec<ValidFlags>,
    pub heal: Vec<HealState>,
    pub raid: RaidType,
}

impl ObjectBranches {
    /// State for an object no branch knows yet.
    pub fn new(bnum: usize, raid: RaidType) -> Self {
        Self {
            handles: vec![None; bnum],
            validity: vec![ValidFlags::empty(); bnum],
            heal: vec![HealState::Ok; bnum],
            raid,
        }
    }

    pub fn bnum(&self) -> usize {
        self.handles.len()
    }

    /// First branch, in bindex order, valid for every category in `mask`.
    pub fn choose_bindex(&self, mask: ValidFlags) -> Option<Bindex> {
        (0..self.bnum()).find(|b| self.is_valid(*b, mask))
    }

    pub fn is_valid(&self, bindex: Bindex, mask: ValidFlags) -> bool {
        self.validity
            .get(bindex)
            .is_some_and(|v| v.contains(mask) && !mask.is_empty())
    }

    pub fn latest_bnum(&self) -> usize {
        self.validity
            .iter()
            .filter(|v| v.contains(ValidFlags::DATA))
            .count()
    }

    /// Kind of the object as seen on its most authoritative copy.
    pub fn kind(&self) -> Option<FileType> {
        self.choose_bindex(ValidFlags::DATA)
            .and_then(|b| self.handles[b])
            .or_else(|| self.handles.iter().flatten().next().copied())
            .map(|h| h.kind)
    }

    /// Whether `bindex` is expected to hold a copy.
    pub fn expects_copy(&self, bindex: Bindex) -> bool {
        bindex == crate::branch::PRIMARY || self.raid.replicates()
    }

    /// Record a healthy copy.
    pub fn mark_ok(&mut self, bindex: Bindex, handle: BranchHandle) {
        self.handles[bindex] = Some(handle);
        self.validity[bindex] = ValidFlags::all();
        self.heal[bindex] = HealState::Ok;
    }

    pub fn mark_suspect(&mut self, bindex: Bindex) {
        self.validity[bindex].remove(ValidFlags::CONTENT);
        if self.heal[bindex] != HealState::Discarded {
            self.heal[bindex] = HealState::Suspect;
        }
    }

    /// Forget the branch's copy for the lifetime of this object.
    pub fn mark_discarded(&mut self, bindex: Bindex) {
        self.handles[bindex] = None;
        self.validity[bindex] = ValidFlags::empty();
        self.heal[bindex] = HealState::Discarded;
    }

    /// Record that a branch legitimately lacks the object.
    pub fn mark_absent(&mut self, bindex: Bindex) {
        self.handles[bindex] = None;
        self.validity[bindex] = ValidFlags::empty();
        self.heal[bindex] = HealState::Ok;
    }

    /// Branches that need a heal.
    pub fn suspects(&self) -> Vec<Bindex> {
        (0..self.bnum())
            .filter(|b| self.heal[*b] == HealState::Suspect)
            .collect()
    }

    /// Branches a write-style operation is sent to.
    pub fn participants(&self) -> Vec<bool> {
        (0..self.bnum())
            .map(|b| self.heal[b] != HealState::Discarded && self.expects_copy(b))
            .collect()
    }

    /// Branch an asynchronous content write lands on: the lowest
    /// participating branch that holds current data.
    pub fn write_target(&self) -> Option<Bindex> {
        let participants = self.participants();
        (0..self.bnum()).find(|b| participants[*b] && self.is_valid(*b, ValidFlags::DATA))
    }

    /// Build an operation list over this object's branches.
    pub fn oplist<T>(&self, path: &Path, keep_order: bool) -> OperationList<T> {
        OperationList::build(path, &self.validity, keep_order)
    }

    /// Persist the outcome of a write-style operation: every branch whose
    /// result disagrees with the consensus is flagged data-bad and loses its
    /// content validity. Returns the branches newly marked suspect.
    pub async fn update<T>(
        &mut self,
        branches: &BranchSet,
        path: &Path,
        list: &OperationList<T>,
    ) -> Vec<Bindex> {
        if list.check() {
            return Vec::new();
        }
        let divergent = list.divergent();
        self.mark_divergent(branches, path, &divergent).await;
        if !divergent.is_empty() {
            tracing::debug!(path = %path.display(), ?divergent, "branches diverged");
        }
        divergent
    }

    /// Flag `bindexes` data-bad on disk where they hold a copy, and mark
    /// them suspect.
    pub async fn mark_divergent(&mut self, branches: &BranchSet, path: &Path, bindexes: &[Bindex]) {
        for &bindex in bindexes {
            if let (Some(handle), Ok(branch)) = (self.handles[bindex].as_mut(), branches.get(bindex)) {
                let bad = handle.flag.databad();
                match flag::set_flag(branch, path, bad).await {
                    Ok(()) => handle.flag = bad,
                    Err(e) => {
                        tracing::warn!(bindex, path = %path.display(), error = %e, "failed to persist data-bad flag");
                    }
                }
            }
            self.mark_suspect(bindex);
        }
    }

    /// Per-branch status rows.
    pub fn status(&self) -> Vec<BranchStatus> {
        (0..self.bnum())
            .map(|bindex| BranchStatus {
                bindex,
                present: self.handles[bindex].is_some(),
                kind: self.handles[bindex].map(|h| h.kind),
                flag: self.handles[bindex].map(|h| h.flag.raw()),
                validity: self.validity[bindex],
                heal: self.heal[bindex],
            })
            .collect()
    }
}

/// Administrative view of one branch's copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BranchStatus {
    pub bindex: Bindex,
    pub present: bool,
    pub kind: Option<FileType>,
    /// Persisted flag word, when the copy exists.
    pub flag: Option<u32>,
    pub validity: ValidFlags,
    pub heal: HealState,
}

/// The union-level object for one path.
///
/// Reads take `branches` shared; metadata writes and heals take it
/// exclusive. Data writes additionally serialize on `content` so long
/// writes do not hold the rwlock exclusively while data moves.
#[derive(Debug)]
pub struct LogicalObject {
    path: PathBuf,
    branches: RwLock<ObjectBranches>,
    content: Mutex<()>,
}

impl LogicalObject {
    pub fn new(path: impl Into<PathBuf>, state: ObjectBranches) -> Self {
        Self {
            path: path.into(),
            branches: RwLock::new(state),
            content: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ObjectBranches> {
        self.branches.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ObjectBranches> {
        self.branches.write().await
    }

    pub async fn lock_content(&self) -> MutexGuard<'_, ()> {
        self.content.lock().await
    }

    /// First branch valid for `mask`, or `NoBranchChosen`.
    pub async fn choose_bindex(&self, mask: ValidFlags) -> ReplicaResult<Bindex> {
        self.read()
            .await
            .choose_bindex(mask)
            .ok_or_else(|| ReplicaError::no_branch(&self.path))
    }

    pub async fn status(&self) -> Vec<BranchStatus> {
        self.read().await.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchKind;
    use crate::branch_fs::{BranchError, BranchOps, MemoryBackend};
    use std::sync::Arc;

    fn handle() -> BranchHandle {
        BranchHandle {
            kind: FileType::File,
            flag: BranchFlag::proper(false, RaidType::Raid1),
        }
    }

    #[test]
    fn test_choose_bindex_scans_in_order() {
        let mut state = ObjectBranches::new(3, RaidType::Raid1);
        assert_eq!(state.choose_bindex(ValidFlags::DATA), None);

        state.mark_ok(2, handle());
        state.mark_ok(1, handle());
        assert_eq!(state.choose_bindex(ValidFlags::DATA), Some(1));

        state.mark_suspect(1);
        assert_eq!(state.choose_bindex(ValidFlags::DATA), Some(2));
        assert_eq!(state.choose_bindex(ValidFlags::BRANCH), Some(1));
        assert_eq!(state.suspects(), vec![1]);
    }

    #[test]
    fn test_discarded_branch_leaves_participants() {
        let mut state = ObjectBranches::new(3, RaidType::Raid1);
        state.mark_discarded(1);
        state.mark_suspect(1);
        assert_eq!(state.heal[1], HealState::Discarded);
        assert_eq!(state.participants(), vec![true, false, true]);

        let single = ObjectBranches::new(3, RaidType::Raid0);
        assert_eq!(single.participants(), vec![true, false, false]);
    }

    #[test]
    fn test_write_target_skips_discarded_and_stale() {
        let mut state = ObjectBranches::new(3, RaidType::Raid1);
        for b in 0..3 {
            state.mark_ok(b, handle());
        }
        assert_eq!(state.write_target(), Some(0));

        state.mark_discarded(0);
        state.mark_suspect(1);
        assert_eq!(state.write_target(), Some(2));

        state.mark_suspect(2);
        assert_eq!(state.write_target(), None);
    }

    #[tokio::test]
    async fn test_update_with_clean_list_changes_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        backend.create(Path::new("f"), 0o644).await.unwrap();
        let set = BranchSet::builder()
            .branch("/b0", BranchKind::Memory, backend.clone())
            .branch("/b1", BranchKind::Memory, Arc::new(MemoryBackend::new()))
            .finalize()
            .unwrap();

        let mut state = ObjectBranches::new(2, RaidType::Raid1);
        state.mark_ok(0, handle());
        state.mark_ok(1, handle());

        let mut list: OperationList<u32> = state.oplist(Path::new("f"), true);
        list.set_branch(0, Ok(1)).unwrap();
        list.set_branch(1, Ok(1)).unwrap();
        assert!(list.check());

        assert!(state.update(&set, Path::new("f"), &list).await.is_empty());
        assert!(state.suspects().is_empty());
        assert!(backend.listxattr(Path::new("f")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_marks_divergent_branches() {
        let backends: Vec<Arc<MemoryBackend>> = (0..3).map(|_| Arc::new(MemoryBackend::new())).collect();
        let mut builder = BranchSet::builder();
        for (i, backend) in backends.iter().enumerate() {
            backend.create(Path::new("f"), 0o644).await.unwrap();
            builder = builder.branch(format!("/b{i}"), BranchKind::Memory, backend.clone());
        }
        let set = builder.finalize().unwrap();

        let mut state = ObjectBranches::new(3, RaidType::Raid1);
        for b in 0..3 {
            state.mark_ok(b, handle());
        }

        let mut list: OperationList<u32> = state.oplist(Path::new("f"), true);
        list.set_branch(0, Ok(1)).unwrap();
        list.set_branch(1, Err(BranchError::injected(5))).unwrap();
        list.set_branch(2, Ok(1)).unwrap();

        let marked = state.update(&set, Path::new("f"), &list).await;
        assert_eq!(marked, vec![1]);
        assert_eq!(state.heal[1], HealState::Suspect);
        assert!(!state.is_valid(1, ValidFlags::DATA));
        assert!(state.is_valid(0, ValidFlags::DATA));

        let persisted = flag::get_flag(set.get(1).unwrap(), Path::new("f")).await.unwrap();
        assert!(persisted.is_databad());
    }
}
