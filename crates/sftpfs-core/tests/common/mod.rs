//! Shared fixtures for dispatcher integration tests.
//!
//! Provides `Fixture`, a dispatcher over an in-memory store that tests can
//! also modify out of band, plus small assertion helpers.

// Not all tests use every helper
#![allow(dead_code)]

use sftpfs_core::{
    CacheConfig, Caller, Dispatcher, FsError, FsResult, LocalStore, MemoryStore, OpenMode,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Identity used for every test operation.
pub const TEST_CALLER: Caller = Caller { uid: 1000, gid: 1000 };

/// A dispatcher plus direct access to the store behind it.
pub struct Fixture {
    pub store: MemoryStore,
    pub fs: Dispatcher,
}

impl Fixture {
    /// Fresh empty store, default cache settings.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Cache that never trusts entries, so every lookup revalidates.
    pub fn uncached() -> Self {
        Self::with_config(CacheConfig::default().attr_ttl(Duration::ZERO))
    }

    pub fn with_config(config: CacheConfig) -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let fs = Dispatcher::new(Arc::new(store.clone()), config, TEST_CALLER);
        Self { store, fs }
    }

    /// Creates a file through the dispatcher and writes `content` to it.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> FsResult<()> {
        if self.fs.resolve(path).map(|r| r.node.is_none()).unwrap_or(true) {
            self.fs.mknod(path, 0o644, TEST_CALLER).await?;
        }
        let h = self.fs.open(path, OpenMode::ReadWrite).await?;
        let written = self.fs.write(h, 0, content).await;
        self.fs.release(h).await?;
        assert_eq!(written?, content.len());
        Ok(())
    }

    /// Reads a whole file through the dispatcher.
    pub async fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let h = self.fs.open(path, OpenMode::Read).await?;
        let size = self.fs.getattr_ino(h)?.size;
        let data = self.fs.read(h, 0, usize::try_from(size).unwrap_or(usize::MAX)).await;
        self.fs.release(h).await?;
        data
    }

    /// Child names of a directory, in enumeration order.
    pub async fn names(&self, path: &str) -> FsResult<Vec<String>> {
        Ok(self
            .fs
            .list_dir(path)
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Returns true if `path` currently resolves in the cache.
    pub fn cached(&self, path: &str) -> bool {
        self.fs.resolve(path).is_ok_and(|r| r.node.is_some())
    }
}

/// A dispatcher over a temporary local directory.
pub struct LocalFixture {
    pub dir: TempDir,
    pub fs: Dispatcher,
}

impl LocalFixture {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("failed to create temp dir");
        let store = LocalStore::new(dir.path()).expect("failed to open local store");
        let fs = Dispatcher::new(Arc::new(store), CacheConfig::local(), TEST_CALLER);
        Self { dir, fs }
    }
}

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Asserts that a result is an error of the given variant.
#[macro_export]
macro_rules! assert_err {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => {}
            other => panic!("expected {}, got {:?}", stringify!($pattern), other),
        }
    };
}

pub fn assert_not_found<T: std::fmt::Debug>(result: FsResult<T>) {
    assert!(
        matches!(result, Err(FsError::NotFound(_))),
        "expected NotFound, got {result:?}"
    );
}
