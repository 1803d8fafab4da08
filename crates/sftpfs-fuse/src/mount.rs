//! Mount lifecycle: spawning the FUSE session and tearing it down.

use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use crate::filesystem::SftpFs;
use fuser::{BackgroundSession, MountOption};
use sftpfs_core::MountStats;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timeout for a graceful `session.join()` before forcing the unmount.
/// The join thread may leak on timeout rather than block the caller.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to a mounted filesystem. Dropping it unmounts.
pub struct FuseMountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
    stats: Arc<MountStats>,
}

impl std::fmt::Debug for FuseMountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseMountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("mounted", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl FuseMountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn stats(&self) -> &Arc<MountStats> {
        &self.stats
    }

    /// Unmounts and waits for the session to finish. Blocks while files
    /// are still open.
    pub fn unmount(mut self) {
        info!(mountpoint = %self.mountpoint.display(), "Unmounting FUSE filesystem");
        if let Some(session) = self.session.take() {
            session.join();
        }
        info!(mountpoint = %self.mountpoint.display(), "FUSE unmount successful");
    }

    /// Detaches the mount with system tools first, then joins the session.
    pub fn force_unmount(mut self) {
        info!(mountpoint = %self.mountpoint.display(), "Force unmounting FUSE filesystem");
        if let Some(session) = self.session.take() {
            force_unmount_path(&self.mountpoint);
            std::thread::sleep(Duration::from_millis(100));
            session.join();
        }
    }
}

impl Drop for FuseMountHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        debug!(mountpoint = %self.mountpoint.display(), "Unmounting on drop");

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            session.join();
            let _ = tx.send(());
        });

        if rx.recv_timeout(JOIN_TIMEOUT).is_err() {
            warn!(
                mountpoint = %self.mountpoint.display(),
                timeout = ?JOIN_TIMEOUT,
                "session.join() timed out, forcing unmount"
            );
            force_unmount_path(&self.mountpoint);
        }
    }
}

/// Unmounts `mountpoint` with the platform's tools, ignoring failures.
pub fn force_unmount_path(mountpoint: &Path) {
    #[cfg(target_os = "macos")]
    {
        let result = std::process::Command::new("diskutil")
            .args(["unmount", "force"])
            .arg(mountpoint)
            .output();
        if matches!(result, Ok(ref output) if output.status.success()) {
            debug!("Force unmount via diskutil succeeded");
            return;
        }
        debug!("diskutil unmount failed, trying umount");
        let _ = std::process::Command::new("umount")
            .arg("-f")
            .arg(mountpoint)
            .output();
    }

    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("fusermount")
            .arg("-uz")
            .arg(mountpoint)
            .output();
    }
}

/// Whether the FUSE kernel side is installed.
pub fn is_fuse_available() -> bool {
    #[cfg(target_os = "macos")]
    {
        Path::new("/Library/Filesystems/macfuse.fs").exists()
    }
    #[cfg(target_os = "linux")]
    {
        Path::new("/dev/fuse").exists()
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        false
    }
}

/// Kernel mount options for `config`.
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("sftpfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    options.push(if config.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    #[cfg(target_os = "macos")]
    {
        options.push(MountOption::CUSTOM(format!("volname={}", config.fs_name)));
        options.push(MountOption::CUSTOM("daemon_timeout=30".to_string()));
    }
    options
}

/// Mounts `fs` at `mountpoint` in the background and waits until the
/// mount is visible.
pub fn mount(fs: SftpFs, mountpoint: &Path) -> FuseResult<FuseMountHandle> {
    let config = fs.config().clone();
    let stats = fs.stats();
    info!(
        mountpoint = %mountpoint.display(),
        fs_name = %config.fs_name,
        "Starting FUSE mount"
    );

    if !mountpoint.exists() {
        std::fs::create_dir_all(mountpoint)?;
    }

    let options = mount_options(&config);
    let session = spawn_mount_with_timeout(fs, mountpoint, options, config.mount_timeout)?;
    let handle = FuseMountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_path_buf(),
        stats,
    };
    // On failure the handle's Drop tears the session down again.
    wait_for_mount(mountpoint, config.mount_timeout)?;

    info!(mountpoint = %mountpoint.display(), "FUSE mount successful");
    Ok(handle)
}

/// Runs `spawn_mount2` on a helper thread so a mount syscall stuck on a
/// stale mountpoint cannot block the caller forever.
fn spawn_mount_with_timeout(
    fs: SftpFs,
    mountpoint: &Path,
    options: Vec<MountOption>,
    timeout: Duration,
) -> FuseResult<BackgroundSession> {
    let mountpoint = mountpoint.to_path_buf();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(fuser::spawn_mount2(fs, &mountpoint, &options));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => Ok(result?),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(FuseError::MountTimeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(FuseError::Io(std::io::Error::other(
            "mount thread terminated unexpectedly",
        ))),
    }
}

/// Polls until `mountpoint` sits on a different device than its parent.
fn wait_for_mount(mountpoint: &Path, timeout: Duration) -> FuseResult<()> {
    let parent = mountpoint.parent().unwrap_or(Path::new("/"));
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let (Ok(path_stat), Ok(parent_stat)) = (
            nix::sys::stat::stat(mountpoint),
            nix::sys::stat::stat(parent),
        ) && path_stat.st_dev != parent_stat.st_dev
        {
            debug!(
                mountpoint = %mountpoint.display(),
                dev = path_stat.st_dev,
                parent_dev = parent_stat.st_dev,
                "FUSE mount confirmed active"
            );
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Err(FuseError::MountTimeout(timeout))
}
