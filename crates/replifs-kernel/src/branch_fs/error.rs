//! Branch filesystem error types.

use std::io;
use thiserror::Error;

/// Error returned by a single branch filesystem call.
///
/// These never reach the caller of a logical operation directly: the
/// dispatcher records them per branch and only the consensus outcome is
/// surfaced (see [`crate::ReplicaError::BranchUnavailable`]).
#[derive(Debug, Error)]
pub enum BranchError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Branch is read-only.
    #[error("branch is read-only")]
    ReadOnly,

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Path escapes the branch root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Not a symbolic link.
    #[error("not a symbolic link: {0}")]
    NotASymlink(String),

    /// Extended attribute is not set.
    #[error("no such attribute: {0}")]
    NoData(String),

    /// Operation not supported by this branch filesystem.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Branch call exceeded the configured deadline.
    #[error("branch call timed out")]
    TimedOut,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl BranchError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn no_data(name: impl Into<String>) -> Self {
        Self::NoData(name.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Build the error an injected fault reports.
    pub fn injected(errno: i32) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno))
    }

    /// True for "object is absent on this branch", including an I/O error
    /// carrying `ENOENT`.
    pub fn is_not_found(&self) -> bool {
        match self {
            BranchError::NotFound(_) => true,
            BranchError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the branch refused a mutation because it is read-only.
    pub fn is_read_only(&self) -> bool {
        match self {
            BranchError::ReadOnly => true,
            BranchError::Io(e) => e.raw_os_error() == Some(30), // EROFS
            _ => false,
        }
    }
}

impl From<BranchError> for io::Error {
    fn from(e: BranchError) -> Self {
        match e {
            BranchError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            BranchError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            BranchError::PermissionDenied(msg) | BranchError::PathEscapesRoot(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            BranchError::ReadOnly => io::Error::new(io::ErrorKind::ReadOnlyFilesystem, "branch is read-only"),
            BranchError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            BranchError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            BranchError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            BranchError::InvalidPath(msg) | BranchError::NotASymlink(msg) => {
                io::Error::new(io::ErrorKind::InvalidInput, msg)
            }
            BranchError::NoData(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            BranchError::Unsupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            BranchError::TimedOut => io::Error::new(io::ErrorKind::TimedOut, "branch call timed out"),
            BranchError::Io(e) => e,
            BranchError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// Branch call result type.
pub type BranchResult<T> = Result<T, BranchError>;
