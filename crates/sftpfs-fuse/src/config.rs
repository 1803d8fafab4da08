//! Mount configuration.
//!
//! The default targets a network remote with a long attribute TTL;
//! [`MountConfig::local()`] suits a directory on a local disk, where
//! out-of-band changes should show up quickly.

use sftpfs_core::CacheConfig;
use std::time::Duration;

/// Default I/O timeout for network remotes.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// I/O timeout for local remotes.
pub const LOCAL_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the kernel may cache entries and attributes we reply with.
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(1);

/// Time allowed for the mount to appear before giving up.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Node cache settings (attribute TTL, size bound, default modes).
    pub cache: CacheConfig,

    /// TTL attached to entry and attribute replies to the kernel.
    pub entry_ttl: Duration,

    /// Timeout for a single operation. Exceeding it fails with ETIMEDOUT
    /// instead of blocking the FUSE session thread.
    pub io_timeout: Duration,

    pub mount_timeout: Duration,

    /// Reject every mutating operation with EROFS.
    pub read_only: bool,

    pub allow_other: bool,

    /// Shown as the filesystem source in the mount table.
    pub fs_name: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            entry_ttl: DEFAULT_ENTRY_TTL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            read_only: false,
            allow_other: false,
            fs_name: "sftpfs".to_string(),
        }
    }
}

impl MountConfig {
    /// Configuration for a remote that is a local directory.
    pub fn local() -> Self {
        Self {
            cache: CacheConfig::local(),
            io_timeout: LOCAL_IO_TIMEOUT,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the node cache attribute TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.cache = self.cache.attr_ttl(ttl);
        self
    }

    #[must_use]
    pub fn max_nodes(mut self, max: usize) -> Self {
        self.cache = self.cache.max_nodes(max);
        self
    }

    #[must_use]
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub fn mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn allow_other(mut self, allow_other: bool) -> Self {
        self.allow_other = allow_other;
        self
    }

    #[must_use]
    pub fn fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftpfs_core::config::{DEFAULT_ATTR_TTL, LOCAL_ATTR_TTL};

    #[test]
    fn test_default_is_network_oriented() {
        let config = MountConfig::default();
        assert_eq!(config.cache.attr_ttl, DEFAULT_ATTR_TTL);
        assert_eq!(config.io_timeout, Duration::from_secs(30));
        assert!(!config.read_only);
        assert_eq!(config.fs_name, "sftpfs");
    }

    #[test]
    fn test_local_mode() {
        let config = MountConfig::local();
        assert_eq!(config.cache.attr_ttl, LOCAL_ATTR_TTL);
        assert_eq!(config.io_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_pattern() {
        let config = MountConfig::default()
            .attr_ttl(Duration::from_secs(120))
            .max_nodes(64)
            .io_timeout(Duration::from_secs(60))
            .read_only(true)
            .fs_name("sftpfs:host");
        assert_eq!(config.cache.attr_ttl, Duration::from_secs(120));
        assert_eq!(config.cache.max_nodes, 64);
        assert_eq!(config.io_timeout, Duration::from_secs(60));
        assert!(config.read_only);
        assert_eq!(config.fs_name, "sftpfs:host");
    }
}
