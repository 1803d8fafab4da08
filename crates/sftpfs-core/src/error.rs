//! Error taxonomy for filesystem operations.
//!
//! Every dispatcher verb returns [`FsResult`]. Cache-level violations are
//! detected locally and returned synchronously; failures of the remote store
//! are folded in through [`From<RemoteError>`], which keeps the "clear"
//! conditions (missing, already present, unsupported) distinguishable and
//! wraps everything else as [`FsError::RemoteIo`].

use crate::remote::RemoteError;
use thiserror::Error;

/// Errno reported when an extended attribute does not exist.
#[cfg(target_os = "linux")]
pub const ENOATTR: i32 = libc::ENODATA;

/// Errno reported when an extended attribute does not exist.
#[cfg(not(target_os = "linux"))]
pub const ENOATTR: i32 = libc::ENOATTR;

/// Errors returned by node cache and dispatcher operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path (or one of its parents) is not present.
    #[error("No such file or directory: {0}")]
    NotFound(String),

    /// Entry already exists at the target path.
    #[error("File exists: {0}")]
    AlreadyExists(String),

    /// A non-directory was found where a directory was required.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A directory was found where a non-directory was required.
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// Directory still has children.
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// A single path component exceeds [`crate::path::NAME_MAX`] bytes.
    #[error("File name too long: {0}")]
    NameTooLong(String),

    /// Malformed request, including renames that would create a cycle.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Extended attribute is not set on the node.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// Extended attribute already set (exclusive create).
    #[error("Attribute exists: {0}")]
    AttributeExists(String),

    /// Operation or attribute name is not supported.
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Operation is not permitted on this node (root removal, directory hard links).
    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    /// No space left for the requested allocation.
    #[error("No space left on device")]
    NoSpace,

    /// A listing callback ran out of room.
    #[error("Result buffer too small")]
    OutOfRange,

    /// Handle is unknown or already released.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// The remote store failed for a reason other than missing/existing paths.
    #[error("Remote I/O error: {0}")]
    RemoteIo(#[source] Box<RemoteError>),
}

impl FsError {
    /// Converts this error to the platform's errno value.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) | FsError::AttributeExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::AttributeNotFound(_) => ENOATTR,
            FsError::OperationNotSupported(_) => libc::ENOTSUP,
            FsError::NotPermitted(_) => libc::EPERM,
            FsError::NoSpace => libc::ENOSPC,
            FsError::OutOfRange => libc::ERANGE,
            FsError::InvalidHandle(_) => libc::EBADF,
            FsError::RemoteIo(_) => libc::EIO,
        }
    }

    /// Host-facing status: the negated errno.
    pub fn status(&self) -> i32 {
        -self.errno()
    }

    /// Returns true for failures that originated in the remote store.
    pub fn is_remote(&self) -> bool {
        matches!(self, FsError::RemoteIo(_))
    }
}

impl From<RemoteError> for FsError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(path) => FsError::NotFound(path),
            RemoteError::AlreadyExists(path) => FsError::AlreadyExists(path),
            RemoteError::Unsupported(op) => FsError::OperationNotSupported(op.to_string()),
            other => FsError::RemoteIo(Box::new(other)),
        }
    }
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Collapses a result into the host status convention (0 or negative errno).
pub fn status_of<T>(result: &FsResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_taxonomy_errno_mapping() {
        let cases = [
            (FsError::NotFound("/a".into()), libc::ENOENT),
            (FsError::AlreadyExists("/a".into()), libc::EEXIST),
            (FsError::NotADirectory("/a".into()), libc::ENOTDIR),
            (FsError::IsADirectory("/a".into()), libc::EISDIR),
            (FsError::DirectoryNotEmpty("/a".into()), libc::ENOTEMPTY),
            (FsError::NameTooLong("x".into()), libc::ENAMETOOLONG),
            (FsError::InvalidArgument("cycle".into()), libc::EINVAL),
            (FsError::AttributeNotFound("k".into()), ENOATTR),
            (FsError::AttributeExists("k".into()), libc::EEXIST),
            (FsError::OperationNotSupported("k".into()), libc::ENOTSUP),
            (FsError::NotPermitted("/".into()), libc::EPERM),
            (FsError::NoSpace, libc::ENOSPC),
            (FsError::OutOfRange, libc::ERANGE),
            (FsError::InvalidHandle(7), libc::EBADF),
        ];
        for (err, errno) in cases {
            assert_eq!(err.errno(), errno, "{err} should map to {errno}");
            assert_eq!(err.status(), -errno);
        }
    }

    #[test]
    fn test_remote_not_found_stays_not_found() {
        let e: FsError = RemoteError::NotFound("/gone".into()).into();
        assert!(matches!(e, FsError::NotFound(ref p) if p == "/gone"));
        assert!(!e.is_remote());
    }

    #[test]
    fn test_remote_exists_stays_exists() {
        let e: FsError = RemoteError::AlreadyExists("/dup".into()).into();
        assert_eq!(e.errno(), libc::EEXIST);
    }

    #[test]
    fn test_remote_unsupported_is_enotsup() {
        let e: FsError = RemoteError::Unsupported("hard link").into();
        assert_eq!(e.errno(), libc::ENOTSUP);
        assert!(!e.is_remote());
    }

    #[test]
    fn test_opaque_remote_failure_is_eio() {
        let e: FsError = RemoteError::Io(io::Error::other("connection reset")).into();
        assert!(e.is_remote());
        assert_eq!(e.errno(), libc::EIO);
        assert!(e.to_string().contains("connection reset"));
    }

    #[test]
    fn test_status_of() {
        let ok: FsResult<()> = Ok(());
        assert_eq!(status_of(&ok), 0);
        let err: FsResult<()> = Err(FsError::DirectoryNotEmpty("/d".into()));
        assert_eq!(status_of(&err), -libc::ENOTEMPTY);
    }
}
