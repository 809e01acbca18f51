//! Operation list: per-call record of every branch's outcome, and the
//! consensus rule that turns those outcomes into one result.
//!
//! A list is built right before a logical operation is dispatched, filled
//! one branch at a time, consumed once, and dropped. Slots are ordered
//! either by bindex (`keep_order`) or latest-first: latest branches in
//! ascending bindex, then the rest in descending bindex.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::branch::{Bindex, PRIMARY};
use crate::branch_fs::{BranchError, BranchResult};
use crate::error::{ReplicaError, ReplicaResult};
use crate::flag::ValidFlags;

/// One branch's place in the list.
#[derive(Debug)]
pub struct BranchSlot<T> {
    pub bindex: Bindex,
    /// The branch held current data when the list was built.
    pub latest: bool,
    outcome: Option<BranchResult<T>>,
}

impl<T> BranchSlot<T> {
    pub fn attempted(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(Ok(_)))
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, Some(Err(_)))
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().and_then(|o| o.as_ref().ok())
    }

    pub fn error(&self) -> Option<&BranchError> {
        self.outcome.as_ref().and_then(|o| o.as_ref().err())
    }
}

/// Tallies over attempted slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OpCounts {
    pub bnum: usize,
    pub latest: usize,
    /// Slots attempted so far.
    pub valid: usize,
    pub success: usize,
    pub success_latest: usize,
    pub success_nonlatest: usize,
    pub fault: usize,
    pub fault_latest: usize,
    pub fault_nonlatest: usize,
}

/// Which branch's outcome the logical operation reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consensus {
    Success(Bindex),
    Failure(Bindex),
    /// Nothing was attempted.
    NoBranch,
}

impl Consensus {
    pub fn is_success(&self) -> bool {
        matches!(self, Consensus::Success(_))
    }
}

/// Per-call outcome record.
#[derive(Debug)]
pub struct OperationList<T> {
    path: PathBuf,
    slots: Vec<BranchSlot<T>>,
    /// `position[bindex]` is the slot index of that branch.
    position: Vec<usize>,
}

impl<T> OperationList<T> {
    /// Build a list for an object whose branches have `validity`.
    ///
    /// A branch is latest when it holds valid data.
    pub fn build(path: &Path, validity: &[ValidFlags], keep_order: bool) -> Self {
        let bnum = validity.len();
        let latest = |bindex: Bindex| validity[bindex].contains(ValidFlags::DATA);

        let order: Vec<Bindex> = if keep_order {
            (0..bnum).collect()
        } else {
            (0..bnum)
                .filter(|b| latest(*b))
                .chain((0..bnum).rev().filter(|b| !latest(*b)))
                .collect()
        };

        let mut position = vec![0; bnum];
        let slots = order
            .into_iter()
            .enumerate()
            .map(|(slot, bindex)| {
                position[bindex] = slot;
                BranchSlot {
                    bindex,
                    latest: latest(bindex),
                    outcome: None,
                }
            })
            .collect();

        Self {
            path: path.to_path_buf(),
            slots,
            position,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bnum(&self) -> usize {
        self.position.len()
    }

    /// Branches in dispatch order.
    pub fn order(&self) -> Vec<Bindex> {
        self.slots.iter().map(|s| s.bindex).collect()
    }

    pub fn slots(&self) -> &[BranchSlot<T>] {
        &self.slots
    }

    pub fn slot(&self, bindex: Bindex) -> Option<&BranchSlot<T>> {
        self.position.get(bindex).map(|pos| &self.slots[*pos])
    }

    /// Record the outcome of `bindex`. Each branch is recorded at most once.
    pub fn set_branch(&mut self, bindex: Bindex, outcome: BranchResult<T>) -> ReplicaResult<()> {
        let bnum = self.bnum();
        let pos = *self
            .position
            .get(bindex)
            .ok_or(ReplicaError::BindexOutOfRange { bindex, bnum })?;
        let slot = &mut self.slots[pos];
        if slot.outcome.is_some() {
            return Err(ReplicaError::SlotAlreadySet { bindex });
        }
        slot.outcome = Some(outcome);
        Ok(())
    }

    pub fn counts(&self) -> OpCounts {
        let mut counts = OpCounts {
            bnum: self.bnum(),
            latest: self.slots.iter().filter(|s| s.latest).count(),
            ..OpCounts::default()
        };
        for slot in self.slots.iter().filter(|s| s.attempted()) {
            counts.valid += 1;
            match (slot.succeeded(), slot.latest) {
                (true, true) => counts.success_latest += 1,
                (true, false) => counts.success_nonlatest += 1,
                (false, true) => counts.fault_latest += 1,
                (false, false) => counts.fault_nonlatest += 1,
            }
        }
        counts.success = counts.success_latest + counts.success_nonlatest;
        counts.fault = counts.fault_latest + counts.fault_nonlatest;
        counts
    }

    /// True when every attempted branch succeeded; false means some branch
    /// now diverges and needs healing.
    pub fn check(&self) -> bool {
        let counts = self.counts();
        counts.success == counts.valid
    }

    /// Decide which branch the operation reports.
    ///
    /// 1. Nothing attempted: no branch.
    /// 2. The primary succeeded: the primary.
    /// 3. A strict majority of latest branches succeeded: the lowest
    ///    succeeding latest bindex.
    /// 4. Otherwise the first failure in slot order, or the lowest success
    ///    when nothing failed.
    pub fn consensus(&self) -> Consensus {
        let counts = self.counts();
        if counts.valid == 0 {
            return Consensus::NoBranch;
        }

        if self.slot(PRIMARY).is_some_and(|s| s.succeeded()) {
            return Consensus::Success(PRIMARY);
        }

        if 2 * counts.success_latest > counts.latest {
            if let Some(bindex) = self
                .slots
                .iter()
                .filter(|s| s.latest && s.succeeded())
                .map(|s| s.bindex)
                .min()
            {
                return Consensus::Success(bindex);
            }
        }

        if let Some(slot) = self.slots.iter().find(|s| s.failed()) {
            return Consensus::Failure(slot.bindex);
        }

        self.slots
            .iter()
            .filter(|s| s.succeeded())
            .map(|s| s.bindex)
            .min()
            .map_or(Consensus::NoBranch, Consensus::Success)
    }

    /// Branches whose outcome disagrees with the consensus.
    pub fn divergent(&self) -> Vec<Bindex> {
        let mut out: Vec<Bindex> = match self.consensus() {
            Consensus::Success(_) => self
                .slots
                .iter()
                .filter(|s| s.failed())
                .map(|s| s.bindex)
                .collect(),
            Consensus::Failure(_) => self
                .slots
                .iter()
                .filter(|s| s.succeeded())
                .map(|s| s.bindex)
                .collect(),
            Consensus::NoBranch => Vec::new(),
        };
        out.sort_unstable();
        out
    }

    /// Branches that succeeded, in ascending bindex.
    pub fn succeeded(&self) -> Vec<Bindex> {
        let mut out: Vec<Bindex> = self
            .slots
            .iter()
            .filter(|s| s.succeeded())
            .map(|s| s.bindex)
            .collect();
        out.sort_unstable();
        out
    }

    /// First success in slot order, the read-path winner.
    pub fn first_success(&self) -> Option<Bindex> {
        self.slots.iter().find(|s| s.succeeded()).map(|s| s.bindex)
    }

    /// Take the outcome of `bindex` as the operation's result.
    pub fn take(mut self, bindex: Bindex) -> ReplicaResult<T> {
        let bnum = self.bnum();
        let pos = *self
            .position
            .get(bindex)
            .ok_or(ReplicaError::BindexOutOfRange { bindex, bnum })?;
        match self.slots[pos].outcome.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(source)) => Err(ReplicaError::branch(bindex, source)),
            None => Err(ReplicaError::no_branch(self.path)),
        }
    }

    /// Consume the list, returning the consensus outcome.
    pub fn into_result(self) -> ReplicaResult<T> {
        match self.consensus() {
            Consensus::Success(bindex) | Consensus::Failure(bindex) => self.take(bindex),
            Consensus::NoBranch => Err(ReplicaError::no_branch(self.path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(n: usize) -> Vec<ValidFlags> {
        vec![ValidFlags::all(); n]
    }

    fn list(validity: &[ValidFlags], keep_order: bool) -> OperationList<u32> {
        OperationList::build(Path::new("f"), validity, keep_order)
    }

    fn eio() -> BranchError {
        BranchError::injected(5)
    }

    #[test]
    fn test_build_orders_latest_first() {
        let mut validity = valid(5);
        validity[1] = ValidFlags::empty();
        validity[3] = ValidFlags::ATTR;

        assert_eq!(list(&validity, false).order(), vec![0, 2, 4, 3, 1]);
        assert_eq!(list(&validity, true).order(), vec![0, 1, 2, 3, 4]);
        assert_eq!(list(&validity, true).counts().latest, 3);
    }

    #[test]
    fn test_set_branch_contract() {
        let mut l = list(&valid(2), true);
        l.set_branch(1, Ok(7)).unwrap();
        assert!(matches!(
            l.set_branch(1, Ok(8)),
            Err(ReplicaError::SlotAlreadySet { bindex: 1 })
        ));
        assert!(matches!(
            l.set_branch(2, Ok(8)),
            Err(ReplicaError::BindexOutOfRange { bindex: 2, bnum: 2 })
        ));
    }

    #[test]
    fn test_nothing_attempted_is_no_branch() {
        let l = list(&valid(3), true);
        assert_eq!(l.consensus(), Consensus::NoBranch);
        assert!(matches!(
            l.into_result(),
            Err(ReplicaError::NoBranchChosen { .. })
        ));
    }

    #[test]
    fn test_primary_success_is_authoritative() {
        // every combination of secondary outcomes
        for mask in 0u32..8 {
            let mut l = list(&valid(4), true);
            l.set_branch(0, Ok(100)).unwrap();
            for b in 1..4 {
                let outcome = if mask & (1 << (b - 1)) != 0 {
                    Ok(b as u32)
                } else {
                    Err(eio())
                };
                l.set_branch(b, outcome).unwrap();
            }
            assert_eq!(l.consensus(), Consensus::Success(0));
            assert_eq!(l.into_result().unwrap(), 100);
        }
    }

    #[test]
    fn test_majority_fallback_lowest_bindex() {
        let mut l = list(&valid(5), true);
        l.set_branch(0, Err(eio())).unwrap();
        l.set_branch(1, Err(eio())).unwrap();
        l.set_branch(2, Ok(2)).unwrap();
        l.set_branch(3, Ok(3)).unwrap();
        l.set_branch(4, Ok(4)).unwrap();

        assert_eq!(l.consensus(), Consensus::Success(2));
        assert_eq!(l.divergent(), vec![0, 1]);
        assert!(!l.check());
        assert_eq!(l.into_result().unwrap(), 2);
    }

    #[test]
    fn test_even_split_is_not_a_majority() {
        let mut l = list(&valid(4), true);
        l.set_branch(0, Err(eio())).unwrap();
        l.set_branch(1, Ok(1)).unwrap();
        l.set_branch(2, Err(BranchError::not_found("f"))).unwrap();
        l.set_branch(3, Ok(3)).unwrap();

        assert_eq!(l.consensus(), Consensus::Failure(0));
        assert_eq!(l.divergent(), vec![1, 3]);
        let err = l.into_result().unwrap_err();
        assert!(matches!(err, ReplicaError::BranchUnavailable { bindex: 0, .. }));
    }

    #[test]
    fn test_nonlatest_successes_do_not_count_toward_majority() {
        let mut validity = valid(3);
        validity[1] = ValidFlags::empty();
        validity[2] = ValidFlags::empty();
        let mut l = list(&validity, false);
        l.set_branch(0, Err(eio())).unwrap();
        l.set_branch(2, Ok(2)).unwrap();
        l.set_branch(1, Ok(1)).unwrap();

        let counts = l.counts();
        assert_eq!(counts.success_nonlatest, 2);
        assert_eq!(counts.fault_latest, 1);
        assert_eq!(l.consensus(), Consensus::Failure(0));
    }

    #[test]
    fn test_only_nonlatest_successes_picks_lowest() {
        let validity = vec![ValidFlags::empty(); 3];
        let mut l = list(&validity, false);
        l.set_branch(2, Ok(2)).unwrap();
        l.set_branch(1, Ok(1)).unwrap();
        assert_eq!(l.consensus(), Consensus::Success(1));
        assert_eq!(l.first_success(), Some(2));
        assert!(l.check());
    }

    #[test]
    fn test_counts_balance() {
        let mut l = list(&valid(3), true);
        l.set_branch(0, Ok(0)).unwrap();
        l.set_branch(2, Err(eio())).unwrap();
        let c = l.counts();
        assert_eq!(c.valid, 2);
        assert_eq!(c.success + c.fault, c.valid);
        assert_eq!(c.success_latest + c.success_nonlatest, c.success);
        assert_eq!(c.fault_latest + c.fault_nonlatest, c.fault);
        assert!(c.valid <= c.bnum);
    }
}
