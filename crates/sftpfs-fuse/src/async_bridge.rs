//! Bridge between synchronous FUSE callbacks and async dispatcher calls.
//!
//! fuser invokes callbacks on its own session thread. Each callback that
//! needs the remote spawns its dispatcher future on the tokio runtime and
//! blocks on a oneshot channel for the result, bounded by the I/O timeout.

use sftpfs_core::FsResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Counters for bridged operations.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub operations_started: AtomicU64,
    pub operations_completed: AtomicU64,
    pub operations_timed_out: AtomicU64,
}

impl BridgeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_complete(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.operations_timed_out.fetch_add(1, Ordering::Relaxed);
    }
}

/// Failure of the bridge itself, as opposed to the bridged operation.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was cancelled")]
    Cancelled,
}

impl BridgeError {
    pub fn to_errno(&self) -> i32 {
        match self {
            BridgeError::Timeout(_) => libc::ETIMEDOUT,
            BridgeError::Cancelled => libc::ECANCELED,
        }
    }
}

/// Runs `future` on `handle` and blocks the calling thread until it
/// completes or `timeout` elapses. A timed-out task is aborted so it cannot
/// keep running against the dispatcher after the kernel got its answer.
pub fn execute<F, T>(
    handle: &Handle,
    timeout: Duration,
    stats: Option<&BridgeStats>,
    future: F,
) -> Result<T, BridgeError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if let Some(s) = stats {
        s.record_start();
    }

    let (tx, rx) = oneshot::channel();
    let task = handle.spawn(async move {
        let result = tokio::time::timeout(timeout, future).await;
        // The receiver is gone only if the caller already gave up.
        let _ = tx.send(result);
    });

    match rx.blocking_recv() {
        Ok(Ok(value)) => {
            if let Some(s) = stats {
                s.record_complete();
            }
            Ok(value)
        }
        Ok(Err(_elapsed)) => {
            task.abort();
            if let Some(s) = stats {
                s.record_timeout();
            }
            Err(BridgeError::Timeout(timeout))
        }
        Err(_closed) => {
            task.abort();
            Err(BridgeError::Cancelled)
        }
    }
}

/// Like [`execute`], for dispatcher futures: both bridge failures and
/// filesystem errors collapse into an errno.
pub fn execute_fs<F, T>(
    handle: &Handle,
    timeout: Duration,
    stats: Option<&BridgeStats>,
    future: F,
) -> Result<T, i32>
where
    F: Future<Output = FsResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match execute(handle, timeout, stats, future) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.errno()),
        Err(e) => Err(e.to_errno()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftpfs_core::FsError;

    #[test]
    fn test_execute_simple() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = execute(rt.handle(), Duration::from_secs(5), None, async { 42 });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_timeout_aborts() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stats = BridgeStats::new();
        let result = execute(
            rt.handle(),
            Duration::from_millis(10),
            Some(&stats),
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                42
            },
        );
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
        assert_eq!(stats.operations_timed_out.load(Ordering::Relaxed), 1);
        assert_eq!(stats.operations_completed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_execute_fs_flattens_errors() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ok = execute_fs(rt.handle(), Duration::from_secs(5), None, async {
            Ok::<_, FsError>("done")
        });
        assert_eq!(ok, Ok("done"));

        let missing = execute_fs(rt.handle(), Duration::from_secs(5), None, async {
            Err::<(), _>(FsError::NotFound("/x".into()))
        });
        assert_eq!(missing, Err(libc::ENOENT));

        let slow = execute_fs(rt.handle(), Duration::from_millis(10), None, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, FsError>(())
        });
        assert_eq!(slow, Err(libc::ETIMEDOUT));
    }
}
