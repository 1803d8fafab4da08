//! Cache configuration.
//!
//! Default configuration is tuned for high-latency remotes (SFTP over WAN)
//! with a longer trust window for cached entries. Use [`CacheConfig::local()`]
//! for local or LAN remotes.

use std::time::Duration;

/// Default time a cached entry is trusted before `lookup` re-stats it.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(30);

/// Trust window for local remotes.
pub const LOCAL_ATTR_TTL: Duration = Duration::from_secs(1);

/// Default soft bound on cached nodes.
pub const DEFAULT_MAX_NODES: usize = 100_000;

/// Configuration for the node cache and reconciliation.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a cached entry is trusted by `lookup` before re-stat.
    ///
    /// Default: 30 seconds (network) or 1 second (local).
    pub attr_ttl: Duration,

    /// Soft bound on the number of cached nodes. Exceeding it triggers
    /// eviction of closed, unreferenced, unmodified leaves.
    pub max_nodes: usize,

    /// Permission bits for files discovered remotely without permissions.
    pub default_file_mode: u32,

    /// Permission bits for directories discovered remotely without permissions.
    pub default_dir_mode: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_ATTR_TTL,
            max_nodes: DEFAULT_MAX_NODES,
            default_file_mode: 0o777,
            default_dir_mode: 0o777,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration for local remotes (short trust window).
    pub fn local() -> Self {
        Self {
            attr_ttl: LOCAL_ATTR_TTL,
            ..Default::default()
        }
    }

    /// Sets the trust window for cached entries.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the soft node bound.
    #[must_use]
    pub fn max_nodes(mut self, max: usize) -> Self {
        self.max_nodes = max;
        self
    }

    /// Sets the fallback permissions for remotely discovered entries.
    #[must_use]
    pub fn default_modes(mut self, file: u32, dir: u32) -> Self {
        self.default_file_mode = file;
        self.default_dir_mode = dir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_network_tuned() {
        let config = CacheConfig::default();
        assert_eq!(config.attr_ttl, Duration::from_secs(30));
        assert_eq!(config.max_nodes, DEFAULT_MAX_NODES);
        assert_eq!(config.default_file_mode, 0o777);
    }

    #[test]
    fn test_local_mode() {
        let config = CacheConfig::local();
        assert_eq!(config.attr_ttl, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_pattern() {
        let config = CacheConfig::default()
            .attr_ttl(Duration::ZERO)
            .max_nodes(16)
            .default_modes(0o644, 0o755);
        assert_eq!(config.attr_ttl, Duration::ZERO);
        assert_eq!(config.max_nodes, 16);
        assert_eq!(config.default_dir_mode, 0o755);
    }
}
