//! Dispatcher: runs one logical operation against the branches.
//!
//! Branch calls are issued one after another, never concurrently, and
//! each attempted branch gets exactly one slot in the operation list.
//!
//! - Read-style calls walk branches in validity order and stop at the
//!   first success; a failing branch falls through to the next valid one.
//! - Write-style calls go to every participating branch in ascending
//!   bindex. If the primary fails and `no_abort` is off, the remaining
//!   branches are skipped and the primary's error is returned as-is.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::branch::{Bindex, Branch, BranchSet, OpMask, PRIMARY};
use crate::branch_fs::{BranchError, BranchResult};
use crate::error::{ReplicaError, ReplicaResult};
use crate::flag::{self, ValidFlags};
use crate::object::ObjectBranches;
use crate::oplist::OperationList;

/// Future returned by a per-branch operation closure.
pub type BranchFuture<'a, T> = Pin<Box<dyn Future<Output = BranchResult<T>> + Send + 'a>>;

/// Replication policy subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(ascii_case_insensitive)]
pub enum Subject {
    /// Every write reaches every branch before it returns.
    #[default]
    #[strum(serialize = "sync_replica", serialize = "sync")]
    SyncReplica,
    /// Content writes reach the primary only; the others are healed later.
    #[strum(serialize = "async_replica", serialize = "async")]
    AsyncReplica,
    /// Synchronous, with every branch call logged.
    #[strum(serialize = "trace")]
    Trace,
}

impl Subject {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::SyncReplica => "SYNC_REPLICA",
            Subject::AsyncReplica => "ASYNC_REPLICA",
            Subject::Trace => "TRACE",
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Global dispatch knobs, fixed at mount.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub no_abort: bool,
    pub subject: Subject,
    /// Per-branch deadline; a call exceeding it counts as a failure.
    pub branch_timeout: Option<Duration>,
}

/// What a write-style operation changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    /// Creates, removes or renames names, or flushes. Always synchronous.
    Namespace,
    /// Changes data, attributes or xattrs of an existing object.
    Content,
}

/// Runs operations against a branch set under a policy.
#[derive(Clone, Copy, Debug)]
pub struct Dispatcher<'a> {
    branches: &'a BranchSet,
    policy: &'a DispatchPolicy,
}

impl<'a> Dispatcher<'a> {
    pub fn new(branches: &'a BranchSet, policy: &'a DispatchPolicy) -> Self {
        Self { branches, policy }
    }

    pub fn branches(&self) -> &'a BranchSet {
        self.branches
    }

    pub fn policy(&self) -> &'a DispatchPolicy {
        self.policy
    }

    /// One branch call, with fault injection and the optional deadline.
    pub async fn call<'f, T, F>(&self, bindex: Bindex, class: OpMask, op: F) -> BranchResult<T>
    where
        'a: 'f,
        F: FnOnce(&'a Branch) -> BranchFuture<'f, T>,
    {
        let branch = self
            .branches
            .get(bindex)
            .map_err(|e| BranchError::other(e.to_string()))?;

        if let Some(err) = branch.debug().injected_error(class) {
            tracing::debug!(bindex, ?class, error = %err, "injected branch fault");
            return Err(err);
        }

        let fut = op(branch);
        let outcome = match self.policy.branch_timeout {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .unwrap_or(Err(BranchError::TimedOut)),
            None => fut.await,
        };

        if self.policy.subject == Subject::Trace {
            match &outcome {
                Ok(_) => tracing::info!(bindex, ?class, "branch call ok"),
                Err(e) => tracing::info!(bindex, ?class, error = %e, "branch call failed"),
            }
        } else if let Err(e) = &outcome {
            tracing::debug!(bindex, ?class, error = %e, "branch call failed");
        }
        outcome
    }

    /// Read-style dispatch.
    ///
    /// Only branches valid for `mask` are tried; the first success wins.
    pub async fn read<'f, T, F>(
        &self,
        state: &ObjectBranches,
        path: &Path,
        mask: ValidFlags,
        keep_order: bool,
        mut op: F,
    ) -> ReplicaResult<(Bindex, T)>
    where
        'a: 'f,
        F: FnMut(&'a Branch) -> BranchFuture<'f, T>,
    {
        let mut list: OperationList<T> = state.oplist(path, keep_order);
        for bindex in list.order() {
            if !state.is_valid(bindex, mask) {
                continue;
            }
            let outcome = self.call(bindex, OpMask::READ, &mut op).await;
            let ok = outcome.is_ok();
            list.set_branch(bindex, outcome)?;
            if ok {
                break;
            }
        }

        match list.first_success() {
            Some(bindex) => list.take(bindex).map(|value| (bindex, value)),
            None => Err(list.into_result().err().unwrap_or_else(|| ReplicaError::no_branch(path))),
        }
    }

    fn is_async(&self, kind: WriteKind) -> bool {
        kind == WriteKind::Content && self.policy.subject == Subject::AsyncReplica
    }

    /// The single branch an asynchronous content write goes to. `None`
    /// means every participant is written, which is also the fallback when
    /// no participant holds current data.
    fn async_target(&self, state: &ObjectBranches, kind: WriteKind) -> Option<Bindex> {
        if self.is_async(kind) {
            state.write_target()
        } else {
            None
        }
    }

    /// Write-style dispatch over every participating branch.
    ///
    /// Returns the filled list for the caller to record new handles and
    /// then [`settle`](Self::settle). Fails early, with no flag changes,
    /// when the object has no latest branch or the primary aborts.
    pub async fn write<'f, T, F>(
        &self,
        state: &ObjectBranches,
        path: &Path,
        kind: WriteKind,
        mut op: F,
    ) -> ReplicaResult<OperationList<T>>
    where
        'a: 'f,
        F: FnMut(&'a Branch) -> BranchFuture<'f, T>,
    {
        if state.latest_bnum() == 0 && !self.policy.no_abort {
            tracing::warn!(path = %path.display(), "no latest branch");
            return Err(ReplicaError::io(PRIMARY, 5));
        }

        let participants = state.participants();
        let target = self.async_target(state, kind);
        let mut list: OperationList<T> = state.oplist(path, true);

        for bindex in list.order() {
            if !participants[bindex] || target.is_some_and(|t| t != bindex) {
                continue;
            }
            let outcome = self.call(bindex, OpMask::WRITE, &mut op).await;
            let primary_failed = bindex == PRIMARY && outcome.is_err();
            list.set_branch(bindex, outcome)?;

            if primary_failed && !self.policy.no_abort {
                tracing::warn!(path = %path.display(), "primary failed, aborting");
                return Err(list.take(PRIMARY).err().unwrap_or_else(|| ReplicaError::io(PRIMARY, 5)));
            }
        }
        Ok(list)
    }

    /// Persist the outcome of a write list and return its result together
    /// with every branch that now needs healing.
    pub async fn settle<T>(
        &self,
        state: &mut ObjectBranches,
        path: &Path,
        kind: WriteKind,
        list: OperationList<T>,
    ) -> (ReplicaResult<T>, Vec<Bindex>) {
        let mut suspects = state.update(self.branches, path, &list).await;

        if self.is_async(kind) && list.consensus().is_success() {
            let participants = state.participants();
            for bindex in 0..state.bnum() {
                let skipped = participants[bindex]
                    && list.slot(bindex).is_some_and(|s| !s.attempted());
                if !skipped {
                    continue;
                }
                if let (Some(handle), Ok(branch)) =
                    (state.handles[bindex].as_mut(), self.branches.get(bindex))
                {
                    let bad = handle.flag.databad();
                    if flag::set_flag(branch, path, bad).await.is_ok() {
                        handle.flag = bad;
                    }
                }
                state.mark_suspect(bindex);
                suspects.push(bindex);
            }
        }

        suspects.sort_unstable();
        suspects.dedup();
        (list.into_result(), suspects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchDebug, BranchKind};
    use crate::branch_fs::{BranchOps, FileAttr, MemoryBackend};
    use crate::flag::{BranchFlag, RaidType};
    use crate::object::{BranchHandle, HealState};
    use std::sync::Arc;

    async fn setup(n: usize) -> (BranchSet, Vec<Arc<MemoryBackend>>, ObjectBranches) {
        let backends: Vec<Arc<MemoryBackend>> = (0..n).map(|_| Arc::new(MemoryBackend::new())).collect();
        let mut builder = BranchSet::builder();
        let mut state = ObjectBranches::new(n, RaidType::Raid1);
        for (i, backend) in backends.iter().enumerate() {
            backend.create(Path::new("f"), 0o644).await.unwrap();
            backend.write(Path::new("f"), 0, format!("b{i}").as_bytes()).await.unwrap();
            builder = builder.branch(format!("/b{i}"), BranchKind::Memory, backend.clone());
            state.mark_ok(
                i,
                BranchHandle {
                    kind: crate::branch_fs::FileType::File,
                    flag: BranchFlag::proper(i == 0, RaidType::Raid1),
                },
            );
        }
        (builder.finalize().unwrap(), backends, state)
    }

    #[tokio::test]
    async fn test_read_short_circuits_on_first_success() {
        let (set, _backends, state) = setup(3).await;
        let policy = DispatchPolicy::default();
        let d = Dispatcher::new(&set, &policy);

        let path = Path::new("f");
        let (bindex, data) = d
            .read(&state, path, ValidFlags::DATA, false, |b| b.ops().read(path, 0, 16))
            .await
            .unwrap();
        assert_eq!(bindex, 0);
        assert_eq!(data, b"b0");
    }

    #[tokio::test]
    async fn test_read_falls_through_failed_branch() {
        let (set, _backends, mut state) = setup(3).await;
        set.get(0).unwrap().set_debug(BranchDebug::failing(5, OpMask::READ));
        state.mark_suspect(1);
        let policy = DispatchPolicy::default();
        let d = Dispatcher::new(&set, &policy);

        let path = Path::new("f");
        let (bindex, data) = d
            .read(&state, path, ValidFlags::DATA, false, |b| b.ops().read(path, 0, 16))
            .await
            .unwrap();
        assert_eq!(bindex, 2);
        assert_eq!(data, b"b2");
    }

    #[tokio::test]
    async fn test_read_with_no_valid_branch() {
        let (set, _backends, _) = setup(2).await;
        let state = ObjectBranches::new(2, RaidType::Raid1);
        let policy = DispatchPolicy::default();
        let d = Dispatcher::new(&set, &policy);

        let path = Path::new("f");
        let err = d
            .read(&state, path, ValidFlags::ATTR, false, |b| b.ops().getattr(path))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::NoBranchChosen { .. }));
    }

    #[tokio::test]
    async fn test_write_primary_abort_skips_rest() {
        let (set, backends, state) = setup(3).await;
        set.get(0).unwrap().set_debug(BranchDebug::failing(28, OpMask::WRITE));
        let policy = DispatchPolicy::default();
        let d = Dispatcher::new(&set, &policy);

        let path = Path::new("f");
        let err = d
            .write(&state, path, WriteKind::Content, |b| b.ops().truncate(path, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::BranchUnavailable { bindex: 0, .. }));
        assert_eq!(backends[1].read_all(path).await.unwrap(), b"b1");
    }

    #[tokio::test]
    async fn test_write_no_abort_continues_and_marks() {
        let (set, backends, mut state) = setup(3).await;
        set.get(0).unwrap().set_debug(BranchDebug::failing(28, OpMask::WRITE));
        let policy = DispatchPolicy {
            no_abort: true,
            ..DispatchPolicy::default()
        };
        let d = Dispatcher::new(&set, &policy);

        let path = Path::new("f");
        let list = d
            .write(&state, path, WriteKind::Content, |b| b.ops().truncate(path, 0))
            .await
            .unwrap();
        let (result, suspects) = d.settle(&mut state, path, WriteKind::Content, list).await;
        result.unwrap();
        assert_eq!(suspects, vec![0]);
        assert_eq!(state.heal[0], HealState::Suspect);
        assert!(backends[2].read_all(path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_without_latest_branch() {
        let (set, _backends, _) = setup(2).await;
        let state = ObjectBranches::new(2, RaidType::Raid1);
        let path = Path::new("f");

        let strict = DispatchPolicy::default();
        let err = Dispatcher::new(&set, &strict)
            .write(&state, path, WriteKind::Content, |b| b.ops().truncate(path, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::BranchUnavailable { bindex: 0, .. }));

        let lenient = DispatchPolicy {
            no_abort: true,
            ..DispatchPolicy::default()
        };
        let list = Dispatcher::new(&set, &lenient)
            .write(&state, path, WriteKind::Content, |b| b.ops().truncate(path, 0))
            .await
            .unwrap();
        assert_eq!(list.counts().valid, 2);
    }

    #[tokio::test]
    async fn test_async_subject_writes_primary_only() {
        let (set, backends, mut state) = setup(3).await;
        let policy = DispatchPolicy {
            subject: Subject::AsyncReplica,
            ..DispatchPolicy::default()
        };
        let d = Dispatcher::new(&set, &policy);

        let path = Path::new("f");
        let list = d
            .write(&state, path, WriteKind::Content, |b| b.ops().write(path, 0, b"XX"))
            .await
            .unwrap();
        let (result, suspects) = d.settle(&mut state, path, WriteKind::Content, list).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(suspects, vec![1, 2]);
        assert_eq!(backends[0].read_all(path).await.unwrap(), b"XX");
        assert_eq!(backends[1].read_all(path).await.unwrap(), b"b1");
    }

    #[tokio::test]
    async fn test_async_subject_without_primary_uses_lowest_latest() {
        let (set, backends, mut state) = setup(3).await;
        state.mark_discarded(0);
        let policy = DispatchPolicy {
            subject: Subject::AsyncReplica,
            ..DispatchPolicy::default()
        };
        let d = Dispatcher::new(&set, &policy);

        let path = Path::new("f");
        let list = d
            .write(&state, path, WriteKind::Content, |b| b.ops().write(path, 0, b"XX"))
            .await
            .unwrap();
        assert_eq!(list.succeeded(), vec![1]);
        let (result, suspects) = d.settle(&mut state, path, WriteKind::Content, list).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(suspects, vec![2]);
        assert_eq!(state.heal, vec![HealState::Discarded, HealState::Ok, HealState::Suspect]);
        assert_eq!(backends[0].read_all(path).await.unwrap(), b"b0");
        assert_eq!(backends[1].read_all(path).await.unwrap(), b"XX");
        assert_eq!(backends[2].read_all(path).await.unwrap(), b"b2");
    }

    #[tokio::test]
    async fn test_branch_timeout_counts_as_failure() {
        let (set, _backends, state) = setup(2).await;
        let policy = DispatchPolicy {
            branch_timeout: Some(Duration::from_millis(10)),
            ..DispatchPolicy::default()
        };
        let d = Dispatcher::new(&set, &policy);

        let outcome: BranchResult<FileAttr> = d
            .call(1, OpMask::READ, |_b| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err(BranchError::other("unreachable"))
                })
            })
            .await;
        assert!(matches!(outcome, Err(BranchError::TimedOut)));
        drop(state);
    }

    #[test]
    fn test_subject_parse() {
        assert_eq!(Subject::from_str("ASYNC_REPLICA"), Some(Subject::AsyncReplica));
        assert_eq!(Subject::from_str("trace"), Some(Subject::Trace));
        assert_eq!(Subject::from_str("bogus"), None);
    }
}
