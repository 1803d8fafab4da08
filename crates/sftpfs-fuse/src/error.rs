//! Errors surfaced by the FUSE adapter and their errno mapping.

use crate::async_bridge::BridgeError;
use sftpfs_core::{FsError, RemoteError};
use std::io;
use thiserror::Error;

/// Errors raised while setting up or serving a mount.
#[derive(Debug, Error)]
pub enum FuseError {
    /// Filesystem operation failed (boxed to keep the enum small).
    #[error("filesystem operation failed: {0}")]
    Fs(Box<FsError>),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Async bridge error (timeout or cancellation).
    #[error("async bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// The remote could not be reached or understood.
    #[error("remote unavailable: {0}")]
    Remote(#[from] RemoteError),

    #[error("invalid remote {0:?}: expected sftp://[user@]host[:port][/path] or a local directory")]
    InvalidRemote(String),

    #[error("mount did not become ready within {0:?}")]
    MountTimeout(std::time::Duration),
}

impl From<FsError> for FuseError {
    fn from(e: FsError) -> Self {
        FuseError::Fs(Box::new(e))
    }
}

impl FuseError {
    pub fn to_errno(&self) -> i32 {
        match self {
            FuseError::Fs(e) => e.errno(),
            FuseError::Io(e) => e.to_errno(),
            FuseError::Bridge(e) => e.to_errno(),
            FuseError::Remote(_) => libc::EIO,
            FuseError::InvalidRemote(_) => libc::EINVAL,
            FuseError::MountTimeout(_) => libc::ETIMEDOUT,
        }
    }
}

pub type FuseResult<T> = Result<T, FuseError>;

/// Conversion of an error into the code handed back to the kernel.
pub trait ToErrno {
    fn to_errno(&self) -> i32;
}

impl ToErrno for FsError {
    fn to_errno(&self) -> i32 {
        self.errno()
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        self.raw_os_error().unwrap_or(match self.kind() {
            io::ErrorKind::NotFound => libc::ENOENT,
            io::ErrorKind::PermissionDenied => libc::EACCES,
            io::ErrorKind::AlreadyExists => libc::EEXIST,
            io::ErrorKind::InvalidInput => libc::EINVAL,
            io::ErrorKind::TimedOut => libc::ETIMEDOUT,
            io::ErrorKind::Unsupported => libc::ENOTSUP,
            _ => libc::EIO,
        })
    }
}

impl ToErrno for BridgeError {
    fn to_errno(&self) -> i32 {
        BridgeError::to_errno(self)
    }
}
