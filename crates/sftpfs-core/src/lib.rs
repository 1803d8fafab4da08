//! Core of a remote-store filesystem adapter.
//!
//! This crate keeps an in-memory model of a remote directory tree and
//! implements POSIX-style filesystem verbs on top of it, independent of any
//! kernel interface.
//!
//! # Components
//!
//! - [`NodeCache`]: arena of cached nodes keyed by inode number, with path
//!   resolution, attributes and extended attributes
//! - [`HandleTable`]: reference-counted open files and directories
//! - [`Dispatcher`]: one method per filesystem verb, writing structural
//!   changes through to the [`RemoteStore`] before committing them locally
//! - [`reconcile`]: merges a fresh remote listing into a cached directory
//! - [`remote`]: the store abstraction plus in-memory, local-directory and
//!   (feature `sftp`) SSH/SFTP implementations
//!
//! # Usage
//!
//! ```ignore
//! use sftpfs_core::{CacheConfig, Caller, Dispatcher, MemoryStore};
//! use std::sync::Arc;
//!
//! let dispatcher = Dispatcher::new(
//!     Arc::new(MemoryStore::new()),
//!     CacheConfig::default(),
//!     Caller::current(),
//! );
//! dispatcher.mkdir("/docs", 0o755, Caller::current()).await?;
//! ```

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handles;
pub mod node;
pub mod path;
pub mod reconcile;
pub mod remote;
pub mod stats;

pub use cache::{AttrChanges, Caller, NodeCache, RESERVED_XATTR, RenamePlan, Resolved, XattrMode};
pub use config::CacheConfig;
pub use dispatcher::{DirEntry, Dispatcher, FALLBACK_CAPACITY};
pub use error::{FsError, FsResult};
pub use handles::{Handle, HandleKind, HandleTable};
pub use node::{Ino, Node, NodeAttr, NodeKind, ROOT_INO};
pub use reconcile::{ReconcileReport, reconcile};
pub use remote::{
    Capacity, FaultPoint, Hold, LocalStore, MemoryStore, OpenMode, RemoteEntry, RemoteError,
    RemoteFile, RemoteKind, RemoteStore,
};
#[cfg(feature = "sftp")]
pub use remote::{SftpAuth, SftpStore, SftpTarget};
pub use stats::{MountStats, MountStatsSnapshot};
