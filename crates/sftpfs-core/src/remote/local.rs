//! A local directory exported as a remote store.
//!
//! Remote paths are resolved beneath `root`; `..` components never reach the
//! filesystem because every path is normalized first. Streams serialize
//! seek+read and seek+write pairs behind an async mutex.

use super::{
    Capacity, OpenMode, RemoteEntry, RemoteError, RemoteFile, RemoteKind, RemoteResult,
    RemoteStore,
};
use crate::path;
use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Remote store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Exports `root`. Fails if it is not an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local(&self, remote: &str) -> PathBuf {
        let mut out = self.root.clone();
        for c in path::components(remote).filter(|c| *c != "..") {
            out.push(c);
        }
        out
    }
}

fn entry_from_metadata(name: String, meta: &std::fs::Metadata) -> RemoteEntry {
    let kind = if meta.file_type().is_symlink() {
        RemoteKind::Symlink
    } else if meta.is_dir() {
        RemoteKind::Directory
    } else {
        RemoteKind::File
    };
    #[cfg(unix)]
    let perm = {
        use std::os::unix::fs::PermissionsExt;
        Some(meta.permissions().mode() & 0o7777)
    };
    #[cfg(not(unix))]
    let perm = None;
    RemoteEntry {
        name,
        kind,
        size: if kind == RemoteKind::Directory { 0 } else { meta.len() },
        perm,
        mtime: meta.modified().ok(),
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn stat(&self, path: &str) -> RemoteResult<RemoteEntry> {
        let meta = fs::symlink_metadata(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))?;
        let name = path::split_last(path)
            .map(|(_, n)| n.to_string())
            .unwrap_or_default();
        Ok(entry_from_metadata(name, &meta))
    }

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let mut dir = fs::read_dir(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))?;
        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match fs::symlink_metadata(entry.path()).await {
                Ok(meta) => out.push(entry_from_metadata(name, &meta)),
                // Raced with a concurrent delete.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn create_file(&self, path: &str) -> RemoteResult<()> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.local(path))
            .await
            .map(drop)
            .map_err(|e| RemoteError::from_io(path, e))
    }

    async fn remove_file(&self, path: &str) -> RemoteResult<()> {
        fs::remove_file(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))
    }

    async fn create_dir(&self, path: &str) -> RemoteResult<()> {
        fs::create_dir(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))
    }

    async fn remove_dir(&self, path: &str) -> RemoteResult<()> {
        fs::remove_dir(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        let target = self.local(to);
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(RemoteError::AlreadyExists(to.to_string()));
        }
        fs::rename(self.local(from), target)
            .await
            .map_err(|e| RemoteError::from_io(from, e))
    }

    async fn open(&self, path: &str, mode: OpenMode) -> RemoteResult<Box<dyn RemoteFile>> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .open(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))?;
        Ok(Box::new(LocalFile {
            file: Mutex::new(file),
        }))
    }

    async fn truncate(&self, path: &str, size: u64) -> RemoteResult<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))?;
        file.set_len(size).await?;
        Ok(())
    }

    #[cfg(unix)]
    async fn symlink(&self, target: &str, path: &str) -> RemoteResult<()> {
        fs::symlink(target, self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))
    }

    async fn read_link(&self, path: &str) -> RemoteResult<String> {
        let target = fs::read_link(self.local(path))
            .await
            .map_err(|e| RemoteError::from_io(path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn hard_link(&self, from: &str, to: &str) -> RemoteResult<()> {
        fs::hard_link(self.local(from), self.local(to))
            .await
            .map_err(|e| RemoteError::from_io(to, e))
    }

    #[cfg(unix)]
    // Field widths differ between platforms; the values fit.
    #[allow(clippy::cast_possible_truncation, clippy::useless_conversion)]
    async fn capacity(&self, path: &str) -> RemoteResult<Option<Capacity>> {
        let target = self.local(path);
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&target))
            .await
            .map_err(|e| RemoteError::Io(io::Error::other(e)))?;
        match stat {
            Ok(stat) => Ok(Some(Capacity {
                block_size: stat.block_size() as u32,
                fragment_size: stat.fragment_size() as u32,
                blocks: u64::from(stat.blocks()),
                blocks_free: u64::from(stat.blocks_free()),
                blocks_available: u64::from(stat.blocks_available()),
                files: u64::from(stat.files()),
                files_free: u64::from(stat.files_free()),
                files_available: u64::from(stat.files_available()),
                name_max: stat.name_max() as u32,
            })),
            Err(e) => {
                debug!(error = %e, "statvfs failed, capacity unavailable");
                Ok(None)
            }
        }
    }
}

struct LocalFile {
    file: Mutex<fs::File>,
}

#[async_trait]
impl RemoteFile for LocalFile {
    async fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> RemoteResult<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    async fn close(&self) -> RemoteResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        Ok(())
    }
}
