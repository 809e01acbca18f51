//! Branch set: the ordered, immutable list of branch filesystems a replica
//! stacks on.
//!
//! Branch 0 is the primary. The set is assembled with [`BranchSetBuilder`]
//! and frozen by [`BranchSetBuilder::finalize`]; its size never changes
//! afterwards.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::branch_fs::{BranchError, BranchOps, LocalBackend, MemoryBackend};
use crate::error::{ReplicaError, ReplicaResult};

/// Zero-based branch index. 0 is the primary.
pub type Bindex = usize;

/// Index of the primary branch.
pub const PRIMARY: Bindex = 0;

/// Ceiling on the number of branches in one replica.
pub const BRANCH_MAX: usize = 32767;

/// Branch filesystem type tag.
///
/// Selects the backend and the default name of the flag xattr: local
/// filesystems mounted without privileges only accept `user.*` attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BranchKind {
    #[default]
    #[strum(serialize = "local", serialize = "dir")]
    Local,
    #[strum(serialize = "memory", serialize = "mem")]
    Memory,
}

impl BranchKind {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchKind::Local => "local",
            BranchKind::Memory => "memory",
        }
    }

    /// Name of the xattr the flag is persisted under.
    pub fn default_flag_xattr(&self) -> &'static str {
        match self {
            BranchKind::Local => "user.replifs.flag",
            BranchKind::Memory => "trusted.replifs.flag",
        }
    }
}

impl std::fmt::Display for BranchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

bitflags! {
    /// Operation classes a fault can be injected into.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct OpMask: u32 {
        const WRITE = 0b01;
        const READ = 0b10;
    }
}

/// Fault-injection state of one branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchDebug {
    pub active: bool,
    /// Raw OS error number reported by injected failures.
    pub errno: i32,
    pub mask: OpMask,
}

impl Default for BranchDebug {
    fn default() -> Self {
        Self {
            active: false,
            errno: 5, // EIO
            mask: OpMask::empty(),
        }
    }
}

impl BranchDebug {
    /// Fail every call in `mask` with `errno`.
    pub fn failing(errno: i32, mask: OpMask) -> Self {
        Self {
            active: true,
            errno,
            mask,
        }
    }

    /// The error an operation of class `class` must report, if any.
    pub fn injected_error(&self, class: OpMask) -> Option<BranchError> {
        (self.active && self.mask.intersects(class)).then(|| BranchError::injected(self.errno))
    }
}

/// One underlying filesystem.
pub struct Branch {
    bindex: Bindex,
    path: PathBuf,
    kind: BranchKind,
    ops: Arc<dyn BranchOps>,
    flag_xattr: String,
    debug: RwLock<BranchDebug>,
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("bindex", &self.bindex)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("flag_xattr", &self.flag_xattr)
            .finish_non_exhaustive()
    }
}

impl Branch {
    pub fn bindex(&self) -> Bindex {
        self.bindex
    }

    pub fn is_primary(&self) -> bool {
        self.bindex == PRIMARY
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> BranchKind {
        self.kind
    }

    pub fn ops(&self) -> &Arc<dyn BranchOps> {
        &self.ops
    }

    pub fn flag_xattr(&self) -> &str {
        &self.flag_xattr
    }

    pub fn debug(&self) -> BranchDebug {
        *self.debug.read()
    }

    pub fn set_debug(&self, debug: BranchDebug) {
        *self.debug.write() = debug;
    }
}

/// Specification of one branch before the set is frozen.
struct PendingBranch {
    path: PathBuf,
    kind: BranchKind,
    ops: Arc<dyn BranchOps>,
    flag_xattr: Option<String>,
}

/// Collects branches in bindex order.
#[derive(Default)]
pub struct BranchSetBuilder {
    pending: Vec<PendingBranch>,
}

impl BranchSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a branch backed by an existing filesystem.
    pub fn branch(
        mut self,
        path: impl Into<PathBuf>,
        kind: BranchKind,
        ops: Arc<dyn BranchOps>,
    ) -> Self {
        self.pending.push(PendingBranch {
            path: path.into(),
            kind,
            ops,
            flag_xattr: None,
        });
        self
    }

    /// Add a branch of `kind` rooted at `path`, creating its backend.
    pub fn open(self, path: impl Into<PathBuf>, kind: BranchKind) -> Self {
        let path = path.into();
        let ops: Arc<dyn BranchOps> = match kind {
            BranchKind::Local => Arc::new(LocalBackend::new(&path)),
            BranchKind::Memory => Arc::new(MemoryBackend::new()),
        };
        self.branch(path, kind, ops)
    }

    /// Override the flag xattr name of the most recently added branch.
    pub fn flag_xattr(mut self, name: impl Into<String>) -> Self {
        if let Some(last) = self.pending.last_mut() {
            last.flag_xattr = Some(name.into());
        }
        self
    }

    /// Validate and freeze the set.
    pub fn finalize(self) -> ReplicaResult<BranchSet> {
        if self.pending.is_empty() {
            return Err(ReplicaError::configuration("at least one branch is required"));
        }
        if self.pending.len() > BRANCH_MAX {
            return Err(ReplicaError::configuration(format!(
                "{} branches exceed the maximum of {BRANCH_MAX}",
                self.pending.len()
            )));
        }

        let mut seen = HashSet::new();
        for pending in &self.pending {
            if !seen.insert(pending.path.clone()) {
                return Err(ReplicaError::configuration(format!(
                    "duplicate branch path {}",
                    pending.path.display()
                )));
            }
        }

        let branches = self
            .pending
            .into_iter()
            .enumerate()
            .map(|(bindex, p)| Branch {
                bindex,
                flag_xattr: p
                    .flag_xattr
                    .unwrap_or_else(|| p.kind.default_flag_xattr().to_string()),
                path: p.path,
                kind: p.kind,
                ops: p.ops,
                debug: RwLock::new(BranchDebug::default()),
            })
            .collect();
        Ok(BranchSet { branches })
    }
}

/// Ordered, fixed-size collection of branches.
#[derive(Debug)]
pub struct BranchSet {
    branches: Vec<Branch>,
}

impl BranchSet {
    pub fn builder() -> BranchSetBuilder {
        BranchSetBuilder::new()
    }

    /// Number of branches (`bnum`).
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Always false for a finalized set; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn get(&self, bindex: Bindex) -> ReplicaResult<&Branch> {
        self.branches
            .get(bindex)
            .ok_or(ReplicaError::BindexOutOfRange {
                bindex,
                bnum: self.branches.len(),
            })
    }

    pub fn primary(&self) -> &Branch {
        &self.branches[PRIMARY]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.iter()
    }
}
