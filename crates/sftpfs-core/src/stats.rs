//! Statistics tracking for a mounted remote.
//!
//! Lock-free counters recorded by the dispatcher: remote round trips and
//! their failures, bytes moved, reconciliation results, evictions and open
//! handles. A [`MountStatsSnapshot`] is logged on unmount.
//!
//! ```
//! use sftpfs_core::stats::MountStats;
//!
//! let stats = MountStats::new();
//! stats.record_remote_call();
//! stats.record_read(4096);
//! assert_eq!(stats.snapshot().bytes_read, 4096);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for remote-store activity and cache maintenance.
#[derive(Debug)]
pub struct MountStats {
    remote_calls: AtomicU64,
    remote_errors: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    nodes_inserted: AtomicU64,
    nodes_pruned: AtomicU64,
    nodes_evicted: AtomicU64,
    open_handles: AtomicU64,
    started: Instant,
}

/// Point-in-time copy of [`MountStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountStatsSnapshot {
    pub remote_calls: u64,
    pub remote_errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub nodes_inserted: u64,
    pub nodes_pruned: u64,
    pub nodes_evicted: u64,
    pub open_handles: u64,
    pub uptime_secs: u64,
}

impl MountStats {
    pub fn new() -> Self {
        Self {
            remote_calls: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            nodes_inserted: AtomicU64::new(0),
            nodes_pruned: AtomicU64::new(0),
            nodes_evicted: AtomicU64::new(0),
            open_handles: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_remote_call(&self) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_error(&self) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_inserted(&self, count: u64) {
        self.nodes_inserted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_pruned(&self, count: u64) {
        self.nodes_pruned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.nodes_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_handle_open(&self) {
        self.open_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handle_close(&self) {
        // Saturating: a stray close must not wrap the gauge.
        let _ = self
            .open_handles
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn snapshot(&self) -> MountStatsSnapshot {
        MountStatsSnapshot {
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            nodes_inserted: self.nodes_inserted.load(Ordering::Relaxed),
            nodes_pruned: self.nodes_pruned.load(Ordering::Relaxed),
            nodes_evicted: self.nodes_evicted.load(Ordering::Relaxed),
            open_handles: self.open_handles.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for MountStats {
    fn default() -> Self {
        Self::new()
    }
}
