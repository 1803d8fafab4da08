//! Remote store collaborator.
//!
//! The dispatcher talks to the authoritative store through [`RemoteStore`].
//! Implementations own connection setup, authentication and wire encoding;
//! the cache layer only sees paths, listings and range reads/writes.
//!
//! # Implementations
//!
//! - [`MemoryStore`] - in-process tree with fault injection, for tests
//! - [`LocalStore`] - exports a local directory through `tokio::fs`
//! - `SftpStore` - SSH/SFTP client (`sftp` feature)

mod local;
mod memory;
#[cfg(feature = "sftp")]
mod sftp;

pub use local::LocalStore;
pub use memory::{FaultPoint, Hold, MemoryStore};
#[cfg(feature = "sftp")]
pub use sftp::{SftpAuth, SftpStore, SftpTarget};

use async_trait::async_trait;
use std::io;
use std::time::SystemTime;
use thiserror::Error;

/// Errors reported by a remote store.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote path does not exist.
    #[error("remote path not found: {0}")]
    NotFound(String),

    /// The remote path already exists.
    #[error("remote path already exists: {0}")]
    AlreadyExists(String),

    /// Transport or server-side I/O failure.
    #[error("remote I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The store does not implement this optional operation.
    #[error("remote store does not support {0}")]
    Unsupported(&'static str),

    /// Any other protocol-level failure.
    #[error("remote protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Classifies an `io::Error` raised while operating on `path`.
    pub fn from_io(path: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => RemoteError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => RemoteError::AlreadyExists(path.to_string()),
            _ => RemoteError::Io(e),
        }
    }
}

/// Result type for remote store operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Kind of a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Directory,
    File,
    Symlink,
}

/// One entry as reported by `stat` or `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Final path component (empty for the root).
    pub name: String,
    pub kind: RemoteKind,
    pub size: u64,
    /// Permission bits if the remote reports them.
    pub perm: Option<u32>,
    pub mtime: Option<SystemTime>,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: RemoteKind::File,
            size,
            perm: None,
            mtime: None,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RemoteKind::Directory,
            size: 0,
            perm: None,
            mtime: None,
        }
    }
}

/// Access requested when opening a remote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Capacity figures in `statvfs` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub block_size: u32,
    pub fragment_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub files_available: u64,
    pub name_max: u32,
}

/// An open remote stream supporting positioned reads and writes.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    /// Reads up to `len` bytes at `offset`. A short or empty result at
    /// end-of-stream is not an error.
    async fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>>;

    /// Writes `data` at `offset`, zero-filling any gap past the current end.
    async fn write_at(&self, offset: u64, data: &[u8]) -> RemoteResult<usize>;

    /// Closes the stream. Further calls are undefined.
    async fn close(&self) -> RemoteResult<()>;
}

/// A hierarchical remote file store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Short label for logs (`memory`, `local:/srv/data`, `sftp://host`).
    fn describe(&self) -> String;

    async fn stat(&self, path: &str) -> RemoteResult<RemoteEntry>;

    /// Lists the children of a directory (no `.`/`..`), in server order.
    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>>;

    /// Creates an empty regular file. Fails if it already exists.
    async fn create_file(&self, path: &str) -> RemoteResult<()>;

    async fn remove_file(&self, path: &str) -> RemoteResult<()>;

    async fn create_dir(&self, path: &str) -> RemoteResult<()>;

    async fn remove_dir(&self, path: &str) -> RemoteResult<()>;

    /// Renames `from` to `to`. `to` must not exist.
    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()>;

    async fn open(&self, path: &str, mode: OpenMode) -> RemoteResult<Box<dyn RemoteFile>>;

    /// Sets the length of a regular file, zero-extending when growing.
    async fn truncate(&self, path: &str, size: u64) -> RemoteResult<()>;

    async fn symlink(&self, _target: &str, _path: &str) -> RemoteResult<()> {
        Err(RemoteError::Unsupported("symlink"))
    }

    async fn read_link(&self, _path: &str) -> RemoteResult<String> {
        Err(RemoteError::Unsupported("readlink"))
    }

    async fn hard_link(&self, _from: &str, _to: &str) -> RemoteResult<()> {
        Err(RemoteError::Unsupported("hard link"))
    }

    /// Capacity query. `Ok(None)` when the store cannot report it.
    async fn capacity(&self, _path: &str) -> RemoteResult<Option<Capacity>> {
        Ok(None)
    }

    /// Ends the session with the remote. No calls follow it.
    async fn close(&self) -> RemoteResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_classification() {
        let e = RemoteError::from_io("/x", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(e, RemoteError::NotFound(ref p) if p == "/x"));

        let e = RemoteError::from_io("/x", io::Error::from(io::ErrorKind::AlreadyExists));
        assert!(matches!(e, RemoteError::AlreadyExists(_)));

        let e = RemoteError::from_io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(e, RemoteError::Io(_)));
    }

    #[test]
    fn test_open_mode_ordering() {
        assert!(OpenMode::ReadWrite > OpenMode::Read);
    }
}
