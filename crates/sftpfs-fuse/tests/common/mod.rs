//! Kernel-mount harness for FUSE integration tests.
//!
//! `TestMount` exports a temporary directory through `LocalStore` and mounts
//! it, so tests can compare what the mount shows with what is on disk.

// Not all tests use all TestMount methods
#![allow(dead_code)]

use sftpfs_core::LocalStore;
use sftpfs_fuse::{FuseMountHandle, MountConfig, SftpFs};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A mounted temporary directory.
pub struct TestMount {
    handle: Option<FuseMountHandle>,
    /// Where the filesystem is mounted.
    pub mount_path: PathBuf,
    /// The exported directory ("the remote").
    pub backing_path: PathBuf,
    _temp: TempDir,
}

impl TestMount {
    pub fn new() -> Result<Self, String> {
        Self::with_config(test_config())
    }

    pub fn read_only() -> Result<Self, String> {
        Self::with_config(test_config().read_only(true))
    }

    pub fn with_config(config: MountConfig) -> Result<Self, String> {
        init_tracing();
        let temp = TempDir::new().map_err(|e| format!("Failed to create temp dir: {e}"))?;
        let backing_path = temp.path().join("remote");
        let mount_path = temp.path().join("mnt");
        fs::create_dir(&backing_path).map_err(|e| format!("Failed to create remote dir: {e}"))?;
        fs::create_dir(&mount_path).map_err(|e| format!("Failed to create mount point: {e}"))?;

        let store = LocalStore::new(&backing_path)
            .map_err(|e| format!("Failed to open local store: {e}"))?;
        let fs = SftpFs::with_config(Arc::new(store), config)
            .map_err(|e| format!("Failed to create SftpFs: {e}"))?;
        let handle =
            sftpfs_fuse::mount(fs, &mount_path).map_err(|e| format!("Failed to mount: {e}"))?;

        Ok(Self {
            handle: Some(handle),
            mount_path,
            backing_path,
            _temp: temp,
        })
    }

    /// Path inside the mount.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.mount_path.join(rel)
    }

    /// Path inside the exported directory, bypassing the mount.
    pub fn remote(&self, rel: &str) -> PathBuf {
        self.backing_path.join(rel)
    }

    pub fn write(&self, rel: &str, data: &[u8]) -> io::Result<()> {
        fs::write(self.path(rel), data)
    }

    pub fn read(&self, rel: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(rel))
    }

    /// Sorted entry names of a directory inside the mount.
    pub fn list(&self, rel: &str) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(self.path(rel))?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    pub fn stats(&self) -> Option<sftpfs_core::MountStatsSnapshot> {
        self.handle.as_ref().map(|h| h.stats().snapshot())
    }
}

impl Drop for TestMount {
    fn drop(&mut self) {
        // Unmount before the TempDir goes away.
        drop(self.handle.take());
    }
}

/// Local preset with kernel caching off so every access reaches the daemon.
pub fn test_config() -> MountConfig {
    MountConfig::local()
        .entry_ttl(Duration::ZERO)
        .attr_ttl(Duration::ZERO)
        .mount_timeout(Duration::from_secs(5))
}

pub fn fuse_available() -> bool {
    sftpfs_fuse::is_fuse_available()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn assert_errno<T: std::fmt::Debug>(result: io::Result<T>, errno: i32) {
    match result {
        Ok(v) => panic!("expected errno {errno}, got Ok({v:?})"),
        Err(e) => assert_eq!(e.raw_os_error(), Some(errno), "unexpected error: {e}"),
    }
}

pub fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Skip test if FUSE is not available.
#[macro_export]
macro_rules! skip_if_no_fuse {
    () => {
        if !$crate::common::fuse_available() {
            eprintln!("Skipping test: FUSE not available on this system");
            return;
        }
    };
}

/// Skip test if mounting fails (common in CI environments).
#[macro_export]
macro_rules! require_mount {
    ($mount_result:expr) => {
        match $mount_result {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Skipping test: {}", e);
                return;
            }
        }
    };
}
