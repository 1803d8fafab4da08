//! FUSE front end for sftpfs.
//!
//! Mounts a remote store (an SFTP server, or a local directory standing in
//! for one) as a native filesystem. Kernel requests are translated into
//! calls on the [`sftpfs_core::Dispatcher`], which keeps the node cache
//! consistent with the remote.
//!
//! # Usage
//!
//! ```ignore
//! use sftpfs_fuse::{MountConfig, SftpFs, mount};
//!
//! let remote = Arc::new(LocalStore::new("/srv/export")?);
//! let fs = SftpFs::with_config(remote, MountConfig::local())?;
//! let handle = mount(fs, Path::new("/mnt/export"))?;
//! ```

pub mod async_bridge;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod mount;

pub use async_bridge::{BridgeError, BridgeStats};
pub use config::MountConfig;
pub use error::{FuseError, FuseResult, ToErrno};
pub use filesystem::SftpFs;
pub use mount::{FuseMountHandle, is_fuse_available, mount, mount_options};
