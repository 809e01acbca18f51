//! # replifs-kernel
//!
//! Replicated union filesystem engine.
//!
//! A replica presents N branch filesystems as one:
//! - Branch 0 is the primary; its outcome is authoritative
//! - Every write-style operation is sent to each branch that should hold a
//!   copy, and the per-branch outcomes are settled into a consensus
//! - Divergent copies are flagged on disk through an extended attribute
//!   and healed from a valid source, or discarded into `.replifs/recover`
//! - A name-pattern rule tree picks RAID1 (every branch) or RAID0 (primary
//!   only) per file
//! - A replica is itself a [`BranchOps`], so replicas stack

pub mod branch;
pub mod branch_fs;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flag;
pub mod heal;
pub mod object;
pub mod oplist;
pub mod queue;
pub mod replica;
pub mod rule_tree;

pub use branch::{
    BRANCH_MAX, Bindex, Branch, BranchDebug, BranchKind, BranchSet, BranchSetBuilder, OpMask,
    PRIMARY,
};
pub use branch_fs::{
    BranchError, BranchOps, BranchResult, DirEntry, FileAttr, FileType, LocalBackend,
    MemoryBackend, SetAttr, StatFs,
};
pub use config::{BranchConfig, HealMode, MountConfig};
pub use dispatch::{BranchFuture, DispatchPolicy, Dispatcher, Subject, WriteKind};
pub use error::{ReplicaError, ReplicaResult};
pub use flag::{BranchFlag, RaidType, ValidFlags};
pub use heal::{HealOutcome, HealWorker, Healer, RECOVER_DIR, RECOVER_PATH};
pub use object::{BranchHandle, BranchStatus, HealState, LogicalObject, ObjectBranches};
pub use oplist::{BranchSlot, Consensus, OpCounts, OperationList};
pub use queue::BoundedQueue;
pub use replica::{ObjectStatus, ReplicaFs, ReplicaOptions};
pub use rule_tree::{Rule, RuleTree};
