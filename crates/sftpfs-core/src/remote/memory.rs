//! In-process remote store.
//!
//! [`MemoryStore`] keeps a flat, insertion-ordered map from normalized path to
//! entry. Listings come back in insertion order, which lets tests assert that
//! directory enumeration follows the remote's order. Faults can be armed per
//! operation class to exercise the remote-failure paths of the dispatcher,
//! and every call is counted so tests can check that an operation was served
//! from the cache. A [`Hold`] parks calls of one class until released, so
//! tests can observe the cache while a remote call is in flight.

use super::{
    Capacity, OpenMode, RemoteEntry, RemoteError, RemoteFile, RemoteKind, RemoteResult,
    RemoteStore,
};
use crate::path;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{Notify, watch};

/// Operation classes that can be made to fail or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `write_at` on open streams.
    Write,
    /// `read_at` on open streams.
    Read,
    /// Directory listings.
    List,
    /// `stat`.
    Stat,
    /// Creation, removal, rename and truncate.
    Mutate,
    /// `open`.
    Open,
}

#[derive(Debug, Clone)]
struct MemEntry {
    kind: RemoteKind,
    /// File content or symlink target.
    data: Vec<u8>,
    perm: Option<u32>,
    mtime: SystemTime,
}

impl MemEntry {
    fn new(kind: RemoteKind, data: Vec<u8>) -> Self {
        Self {
            kind,
            data,
            perm: None,
            mtime: SystemTime::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Mutex<IndexMap<String, MemEntry>>,
    faults: Mutex<HashSet<FaultPoint>>,
    capacity: Mutex<Option<Capacity>>,
    holds: Mutex<HashMap<FaultPoint, (Arc<Notify>, watch::Receiver<bool>)>>,
    calls: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    /// Waits at an armed [`Hold`] for `point`, then counts the call and
    /// applies any armed fault.
    async fn checkpoint(&self, point: FaultPoint) -> RemoteResult<()> {
        let hold = self.holds.lock().get(&point).cloned();
        if let Some((entered, mut released)) = hold {
            entered.notify_one();
            // A dropped `Hold` lets the call through as well.
            let _ = released.wait_for(|open| *open).await;
        }
        self.enter(Some(point))
    }

    fn enter(&self, point: Option<FaultPoint>) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match point {
            Some(p) if self.faults.lock().contains(&p) => Err(RemoteError::Io(io::Error::other(
                format!("injected {p:?} fault"),
            ))),
            _ => Ok(()),
        }
    }
}

/// A remote store held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates a store containing only the root directory.
    pub fn new() -> Self {
        let inner = Inner::default();
        inner
            .entries
            .lock()
            .insert("/".to_string(), MemEntry::new(RemoteKind::Directory, Vec::new()));
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Makes every subsequent operation of class `point` fail with an I/O error.
    pub fn fail(&self, point: FaultPoint) {
        self.inner.faults.lock().insert(point);
    }

    /// Clears all armed faults.
    pub fn heal(&self) {
        self.inner.faults.lock().clear();
    }

    /// Parks every subsequent operation of class `point` until the returned
    /// [`Hold`] is released or dropped.
    pub fn hold(&self, point: FaultPoint) -> Hold {
        let entered = Arc::new(Notify::new());
        let (release, released) = watch::channel(false);
        self.inner
            .holds
            .lock()
            .insert(point, (Arc::clone(&entered), released));
        Hold {
            inner: Arc::clone(&self.inner),
            point,
            entered,
            release,
        }
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// Sets the figures returned by `capacity`.
    pub fn set_capacity(&self, capacity: Option<Capacity>) {
        *self.inner.capacity.lock() = capacity;
    }

    /// Total number of remote calls served so far.
    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::Relaxed)
    }

    /// Out-of-band: writes a file (creating parents) without going through
    /// the cache, as another client of the remote would.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        ensure_parents(&mut entries, &path);
        entries.insert(path, MemEntry::new(RemoteKind::File, data.to_vec()));
    }

    /// Out-of-band: creates a directory (and its parents).
    pub fn put_dir(&self, path: &str) {
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        ensure_parents(&mut entries, &path);
        entries
            .entry(path)
            .or_insert_with(|| MemEntry::new(RemoteKind::Directory, Vec::new()));
    }

    /// Out-of-band: creates a symlink.
    pub fn put_symlink(&self, path: &str, target: &str) {
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        ensure_parents(&mut entries, &path);
        entries.insert(
            path,
            MemEntry::new(RemoteKind::Symlink, target.as_bytes().to_vec()),
        );
    }

    /// Out-of-band: deletes an entry and everything under it.
    pub fn delete(&self, path: &str) {
        let path = path::normalize(path);
        let prefix = format!("{path}/");
        self.inner
            .entries
            .lock()
            .retain(|p, _| p != &path && !p.starts_with(&prefix));
    }

    /// Content of a file as the remote currently holds it.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let entries = self.inner.entries.lock();
        entries
            .get(&path::normalize(path))
            .filter(|e| e.kind == RemoteKind::File)
            .map(|e| e.data.clone())
    }

    /// Returns true if the remote has an entry at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.inner
            .entries
            .lock()
            .contains_key(&path::normalize(path))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A gate armed by [`MemoryStore::hold`].
#[derive(Debug)]
pub struct Hold {
    inner: Arc<Inner>,
    point: FaultPoint,
    entered: Arc<Notify>,
    release: watch::Sender<bool>,
}

impl Hold {
    /// Resolves once a call has reached the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Lets parked and future calls through.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.inner.holds.lock().remove(&self.point);
        let _ = self.release.send(true);
    }
}

fn ensure_parents(entries: &mut IndexMap<String, MemEntry>, path: &str) {
    let mut current = String::new();
    let parts: Vec<&str> = path::components(path).collect();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(part);
        entries
            .entry(current.clone())
            .or_insert_with(|| MemEntry::new(RemoteKind::Directory, Vec::new()));
    }
}

fn to_entry(path: &str, e: &MemEntry) -> RemoteEntry {
    let name = path::split_last(path)
        .map(|(_, n)| n.to_string())
        .unwrap_or_default();
    RemoteEntry {
        name,
        kind: e.kind,
        size: e.data.len() as u64,
        perm: e.perm,
        mtime: Some(e.mtime),
    }
}

fn parent_is_dir(entries: &IndexMap<String, MemEntry>, path: &str) -> RemoteResult<()> {
    let (parent, _) = path::split_last(path)
        .ok_or_else(|| RemoteError::AlreadyExists("/".to_string()))?;
    match entries.get(&parent) {
        Some(e) if e.kind == RemoteKind::Directory => Ok(()),
        Some(_) => Err(RemoteError::Protocol(format!("{parent} is not a directory"))),
        None => Err(RemoteError::NotFound(parent)),
    }
}

fn insert_new(
    entries: &mut IndexMap<String, MemEntry>,
    path: &str,
    entry: MemEntry,
) -> RemoteResult<()> {
    parent_is_dir(entries, path)?;
    if entries.contains_key(path) {
        return Err(RemoteError::AlreadyExists(path.to_string()));
    }
    entries.insert(path.to_string(), entry);
    Ok(())
}

fn offset_to_usize(offset: u64) -> RemoteResult<usize> {
    usize::try_from(offset)
        .map_err(|_| RemoteError::Io(io::Error::from(io::ErrorKind::InvalidInput)))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn stat(&self, path: &str) -> RemoteResult<RemoteEntry> {
        self.inner.checkpoint(FaultPoint::Stat).await?;
        let path = path::normalize(path);
        let entries = self.inner.entries.lock();
        entries
            .get(&path)
            .map(|e| to_entry(&path, e))
            .ok_or(RemoteError::NotFound(path))
    }

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        self.inner.checkpoint(FaultPoint::List).await?;
        let path = path::normalize(path);
        let entries = self.inner.entries.lock();
        match entries.get(&path) {
            Some(e) if e.kind == RemoteKind::Directory => {}
            Some(_) => return Err(RemoteError::Protocol(format!("{path} is not a directory"))),
            None => return Err(RemoteError::NotFound(path)),
        }
        Ok(entries
            .iter()
            .filter(|(p, _)| {
                p.as_str() != "/"
                    && path::split_last(p).is_some_and(|(parent, _)| parent == path)
            })
            .map(|(p, e)| to_entry(p, e))
            .collect())
    }

    async fn create_file(&self, path: &str) -> RemoteResult<()> {
        self.inner.checkpoint(FaultPoint::Mutate).await?;
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        insert_new(&mut entries, &path, MemEntry::new(RemoteKind::File, Vec::new()))
    }

    async fn remove_file(&self, path: &str) -> RemoteResult<()> {
        self.inner.checkpoint(FaultPoint::Mutate).await?;
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        match entries.get(&path) {
            Some(e) if e.kind == RemoteKind::Directory => {
                Err(RemoteError::Protocol(format!("{path} is a directory")))
            }
            Some(_) => {
                entries.shift_remove(&path);
                Ok(())
            }
            None => Err(RemoteError::NotFound(path)),
        }
    }

    async fn create_dir(&self, path: &str) -> RemoteResult<()> {
        self.inner.checkpoint(FaultPoint::Mutate).await?;
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        insert_new(&mut entries, &path, MemEntry::new(RemoteKind::Directory, Vec::new()))
    }

    async fn remove_dir(&self, path: &str) -> RemoteResult<()> {
        self.inner.checkpoint(FaultPoint::Mutate).await?;
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        match entries.get(&path) {
            Some(e) if e.kind != RemoteKind::Directory => {
                return Err(RemoteError::Protocol(format!("{path} is not a directory")));
            }
            Some(_) => {}
            None => return Err(RemoteError::NotFound(path)),
        }
        let prefix = format!("{path}/");
        if entries.keys().any(|p| p.starts_with(&prefix)) {
            return Err(RemoteError::Protocol(format!("{path} is not empty")));
        }
        entries.shift_remove(&path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()> {
        self.inner.checkpoint(FaultPoint::Mutate).await?;
        let from = path::normalize(from);
        let to = path::normalize(to);
        let mut entries = self.inner.entries.lock();
        if !entries.contains_key(&from) {
            return Err(RemoteError::NotFound(from));
        }
        parent_is_dir(&entries, &to)?;
        if entries.contains_key(&to) {
            return Err(RemoteError::AlreadyExists(to));
        }
        let prefix = format!("{from}/");
        let moved: Vec<String> = entries
            .keys()
            .filter(|p| **p == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(entry) = entries.shift_remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                entries.insert(new, entry);
            }
        }
        Ok(())
    }

    async fn open(&self, path: &str, mode: OpenMode) -> RemoteResult<Box<dyn RemoteFile>> {
        self.inner.checkpoint(FaultPoint::Open).await?;
        let path = path::normalize(path);
        let entries = self.inner.entries.lock();
        match entries.get(&path) {
            Some(e) if e.kind == RemoteKind::File => Ok(Box::new(MemoryFile {
                inner: Arc::clone(&self.inner),
                path,
                mode,
            })),
            Some(_) => Err(RemoteError::Protocol(format!("{path} is not a regular file"))),
            None => Err(RemoteError::NotFound(path)),
        }
    }

    async fn truncate(&self, path: &str, size: u64) -> RemoteResult<()> {
        self.inner.checkpoint(FaultPoint::Mutate).await?;
        let path = path::normalize(path);
        let size = offset_to_usize(size)?;
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(&path) {
            Some(e) if e.kind == RemoteKind::File => {
                e.data.resize(size, 0);
                e.mtime = SystemTime::now();
                Ok(())
            }
            Some(_) => Err(RemoteError::Protocol(format!("{path} is not a regular file"))),
            None => Err(RemoteError::NotFound(path)),
        }
    }

    async fn symlink(&self, target: &str, path: &str) -> RemoteResult<()> {
        self.inner.checkpoint(FaultPoint::Mutate).await?;
        let path = path::normalize(path);
        let mut entries = self.inner.entries.lock();
        insert_new(
            &mut entries,
            &path,
            MemEntry::new(RemoteKind::Symlink, target.as_bytes().to_vec()),
        )
    }

    async fn read_link(&self, path: &str) -> RemoteResult<String> {
        self.inner.checkpoint(FaultPoint::Stat).await?;
        let path = path::normalize(path);
        let entries = self.inner.entries.lock();
        match entries.get(&path) {
            Some(e) if e.kind == RemoteKind::Symlink => {
                Ok(String::from_utf8_lossy(&e.data).into_owned())
            }
            Some(_) => Err(RemoteError::Protocol(format!("{path} is not a symlink"))),
            None => Err(RemoteError::NotFound(path)),
        }
    }

    async fn capacity(&self, _path: &str) -> RemoteResult<Option<Capacity>> {
        self.inner.enter(None)?;
        Ok(*self.inner.capacity.lock())
    }

    async fn close(&self) -> RemoteResult<()> {
        self.inner.enter(None)?;
        self.inner.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Stream over a [`MemoryStore`] file. Reads and writes see the live entry,
/// so concurrent out-of-band changes are visible.
struct MemoryFile {
    inner: Arc<Inner>,
    path: String,
    mode: OpenMode,
}

#[async_trait]
impl RemoteFile for MemoryFile {
    async fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        self.inner.checkpoint(FaultPoint::Read).await?;
        let entries = self.inner.entries.lock();
        let entry = entries
            .get(&self.path)
            .ok_or_else(|| RemoteError::NotFound(self.path.clone()))?;
        let start = offset_to_usize(offset)?.min(entry.data.len());
        let end = start.saturating_add(len).min(entry.data.len());
        Ok(entry.data[start..end].to_vec())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> RemoteResult<usize> {
        self.inner.checkpoint(FaultPoint::Write).await?;
        if self.mode != OpenMode::ReadWrite {
            return Err(RemoteError::Io(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        let mut entries = self.inner.entries.lock();
        let entry = entries
            .get_mut(&self.path)
            .ok_or_else(|| RemoteError::NotFound(self.path.clone()))?;
        let start = offset_to_usize(offset)?;
        let end = start + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[start..end].copy_from_slice(data);
        entry.mtime = SystemTime::now();
        Ok(data.len())
    }

    async fn close(&self) -> RemoteResult<()> {
        self.inner.enter(None)
    }
}
