//! Replica error taxonomy.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::branch::Bindex;
use crate::branch_fs::BranchError;

/// Errors surfaced by the replica layer.
///
/// Per-branch failures are recorded in the operation list; only the
/// consensus outcome of a logical operation becomes one of these.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The branch whose error the consensus chose to report.
    #[error("branch {bindex} unavailable: {source}")]
    BranchUnavailable {
        bindex: Bindex,
        #[source]
        source: BranchError,
    },

    /// No branch satisfies the validity a read requires.
    #[error("no branch available for {}", path.display())]
    NoBranchChosen { path: PathBuf },

    /// A persisted flag failed validation.
    #[error("inconsistent flag {raw:#010x} on branch {bindex}")]
    InconsistentFlag { bindex: Bindex, raw: u32 },

    /// Mount-time configuration was rejected.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Healing could not bring a branch up to date.
    #[error("heal of branch {bindex} failed: {reason}")]
    HealUnrecoverable { bindex: Bindex, reason: String },

    /// The request was refused before any branch was called.
    #[error("rejected: {0}")]
    Rejected(BranchError),

    /// Operation-list contract violation.
    #[error("bindex {bindex} out of range (bnum {bnum})")]
    BindexOutOfRange { bindex: Bindex, bnum: usize },

    /// Operation-list contract violation.
    #[error("branch {bindex} already recorded")]
    SlotAlreadySet { bindex: Bindex },
}

impl ReplicaError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn branch(bindex: Bindex, source: BranchError) -> Self {
        Self::BranchUnavailable { bindex, source }
    }

    pub fn no_branch(path: impl Into<PathBuf>) -> Self {
        Self::NoBranchChosen { path: path.into() }
    }

    /// Branch-level I/O failure without a specific branch error behind it.
    pub fn io(bindex: Bindex, errno: i32) -> Self {
        Self::branch(bindex, BranchError::injected(errno))
    }

    pub fn rejected(source: BranchError) -> Self {
        Self::Rejected(source)
    }

    /// The underlying branch error, when there is one.
    pub fn branch_error(&self) -> Option<&BranchError> {
        match self {
            ReplicaError::BranchUnavailable { source, .. } | ReplicaError::Rejected(source) => {
                Some(source)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ReplicaError::BranchUnavailable { source, .. } | ReplicaError::Rejected(source) => {
                source.is_not_found()
            }
            ReplicaError::NoBranchChosen { .. } => true,
            _ => false,
        }
    }
}

impl From<ReplicaError> for io::Error {
    fn from(e: ReplicaError) -> Self {
        match e {
            ReplicaError::BranchUnavailable { source, .. } | ReplicaError::Rejected(source) => {
                source.into()
            }
            ReplicaError::NoBranchChosen { path } => {
                io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
            }
            ReplicaError::Configuration(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Lets a replica serve as a branch of another replica.
impl From<ReplicaError> for BranchError {
    fn from(e: ReplicaError) -> Self {
        match e {
            ReplicaError::BranchUnavailable { source, .. } | ReplicaError::Rejected(source) => source,
            ReplicaError::NoBranchChosen { path } => BranchError::not_found(path.display().to_string()),
            other => BranchError::Io(other.into()),
        }
    }
}

/// Replica result type.
pub type ReplicaResult<T> = Result<T, ReplicaError>;
