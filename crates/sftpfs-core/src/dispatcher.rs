//! Operation dispatcher.
//!
//! Implements every filesystem verb by combining node cache and handle table
//! updates with calls to the remote store. The cache and the handle table sit
//! behind one mutex, which is never held across an `.await`: each verb that
//! talks to the remote validates under the lock, releases it for the network
//! call, then re-acquires it to commit by inode.
//!
//! # Write-through
//!
//! Structural changes (create, mkdir, symlink, link, unlink, rmdir, rename)
//! and truncation reach the remote first and are committed to the cache only
//! after the remote call succeeds. Permission, ownership, timestamp and flag
//! edits and extended attributes stay in the cache.
//!
//! # Cache misses
//!
//! Path-based verbs first make sure every component of the path is cached,
//! stat-ing missing components remotely. A directory listed within
//! `attr_ttl` is trusted to be complete, so misses under it are answered
//! locally.

use crate::cache::{AttrChanges, Caller, NodeCache, Resolved, UpsertOutcome, XattrMode};
use crate::config::CacheConfig;
use crate::error::{FsError, FsResult};
use crate::handles::{Handle, HandleEntry, HandleKind, HandleTable};
use crate::node::{Ino, Node, NodeAttr, NodeKind, ROOT_INO};
use crate::path;
use crate::reconcile::reconcile;
use crate::remote::{Capacity, OpenMode, RemoteEntry, RemoteFile, RemoteResult, RemoteStore};
use crate::stats::MountStats;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, warn};

/// Capacity reported when the remote cannot answer a capacity query.
pub const FALLBACK_CAPACITY: Capacity = Capacity {
    block_size: 4096,
    fragment_size: 4096,
    blocks: (8 << 50) / 4096 * 1024 - 1,
    blocks_free: (2 << 50) / 4096 * 1024,
    blocks_available: (2 << 50) / 4096 * 1024,
    files: 2_240_224,
    files_free: 1_927_486,
    files_available: 1_927_486,
    name_max: 255,
};

/// One entry produced by [`Dispatcher::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: Ino,
    pub kind: NodeKind,
    /// Absent if the node was evicted after the listing was taken.
    pub attr: Option<NodeAttr>,
    /// Offset to resume enumeration after this entry.
    pub offset: i64,
}

struct State {
    cache: NodeCache,
    handles: HandleTable,
}

/// The operation dispatcher.
pub struct Dispatcher {
    state: Mutex<State>,
    remote: Arc<dyn RemoteStore>,
    stats: Arc<MountStats>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("remote", &self.remote.describe())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over `remote`. The root directory and entries
    /// discovered remotely are owned by `owner`.
    pub fn new(remote: Arc<dyn RemoteStore>, config: CacheConfig, owner: Caller) -> Self {
        Self {
            state: Mutex::new(State {
                cache: NodeCache::new(config, owner),
                handles: HandleTable::new(),
            }),
            remote,
            stats: Arc::new(MountStats::new()),
        }
    }

    /// Shares an externally owned statistics block.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<MountStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<MountStats> {
        &self.stats
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Number of cached nodes.
    pub fn cached_nodes(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Number of open handle-table entries.
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Runs one remote call, keeping the statistics current.
    async fn call<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = RemoteResult<T>>,
    ) -> FsResult<T> {
        self.stats.record_remote_call();
        fut.await.map_err(|e| {
            self.stats.record_remote_error();
            debug!(op = what, error = %e, "Remote call failed");
            FsError::from(e)
        })
    }

    fn maybe_evict(&self, cache: &mut NodeCache) {
        if cache.len() > cache.config().max_nodes {
            let evicted = cache.evict();
            if evicted > 0 {
                self.stats.record_evicted(evicted);
                debug!(evicted, remaining = cache.len(), "Evicted cached nodes");
            }
        }
    }

    /// Inserts or refreshes one remotely observed entry under `parent`.
    fn commit_entry(&self, cache: &mut NodeCache, parent: Ino, entry: &RemoteEntry) -> FsResult<Ino> {
        match cache.get(parent) {
            Some(node) if node.is_dir() => {}
            Some(_) => return Err(FsError::NotADirectory(format!("inode {parent}"))),
            None => return Err(FsError::NotFound(format!("inode {parent}"))),
        }
        let (ino, outcome) = cache.upsert(parent, entry);
        if outcome != UpsertOutcome::Updated {
            self.stats.record_inserted(1);
        }
        Ok(ino)
    }

    /// Makes sure every component of `path` that exists remotely is cached.
    ///
    /// Stops quietly at the first component the remote does not have; the
    /// caller's own resolution then reports it.
    async fn ensure_cached(&self, path: &str) -> FsResult<()> {
        let mut current = ROOT_INO;
        let mut walked = String::from("/");
        for part in path::components(path) {
            path::check_name(part)?;
            let child_path = path::join(&walked, part);
            let cached = {
                let state = self.state.lock();
                let node = state
                    .cache
                    .get(current)
                    .ok_or_else(|| FsError::NotFound(walked.clone()))?;
                if !node.is_dir() {
                    return Err(FsError::NotADirectory(walked));
                }
                match node.child(part) {
                    Some(ino) => Some(ino),
                    None if node.listed && state.cache.is_fresh(current) => return Ok(()),
                    None => None,
                }
            };
            current = match cached {
                Some(ino) => ino,
                None => match self.call("stat", self.remote.stat(&child_path)).await {
                    Ok(entry) => {
                        let entry = RemoteEntry {
                            name: part.to_string(),
                            ..entry
                        };
                        let mut state = self.state.lock();
                        self.commit_entry(&mut state.cache, current, &entry)?
                    }
                    Err(FsError::NotFound(_)) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };
            walked = child_path;
        }
        Ok(())
    }

    // ---- inode-level helpers for the host adapter ----

    /// Path of an attached node.
    pub fn path_of(&self, ino: Ino) -> FsResult<String> {
        self.state
            .lock()
            .cache
            .path_of(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    /// Attributes by inode, including detached nodes that are still open.
    pub fn getattr_ino(&self, ino: Ino) -> FsResult<NodeAttr> {
        self.state.lock().cache.attr(ino)
    }

    /// Records a kernel lookup reference.
    pub fn remember(&self, ino: Ino) {
        self.state.lock().cache.remember(ino);
    }

    /// Drops kernel lookup references.
    pub fn forget(&self, ino: Ino, n: u64) {
        self.state.lock().cache.forget(ino, n);
    }

    /// Walks `path` through the cache without contacting the remote.
    pub fn resolve(&self, path: &str) -> FsResult<Resolved> {
        self.state.lock().cache.resolve(path, None)
    }

    // ---- lookup and attributes ----

    /// Looks up `path`, trusting a cached entry for `attr_ttl` and otherwise
    /// re-stat-ing it remotely (inserting, refreshing or pruning it).
    pub async fn lookup(&self, path: &str) -> FsResult<NodeAttr> {
        let Some((parent_path, _)) = path::split_last(path) else {
            return self.getattr_ino(ROOT_INO);
        };
        self.ensure_cached(&parent_path).await?;

        let (parent, name) = {
            let state = self.state.lock();
            let r = state.cache.resolve(path, None)?;
            let parent = r
                .parent
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            match r.node {
                Some(ino) if state.cache.is_fresh(ino) => return state.cache.attr(ino),
                None if state.cache.get(parent).is_some_and(|p| p.listed)
                    && state.cache.is_fresh(parent) =>
                {
                    return Err(FsError::NotFound(path.to_string()));
                }
                _ => (parent, r.name),
            }
        };

        let requested = Instant::now();
        match self.call("stat", self.remote.stat(path)).await {
            Ok(entry) => {
                let entry = RemoteEntry { name, ..entry };
                let mut state = self.state.lock();
                let ino = self.commit_entry(&mut state.cache, parent, &entry)?;
                let attr = state.cache.attr(ino)?;
                self.maybe_evict(&mut state.cache);
                Ok(attr)
            }
            Err(FsError::NotFound(p)) => {
                let mut state = self.state.lock();
                let stale = state
                    .cache
                    .child(parent, &name)
                    .and_then(|ino| state.cache.get(ino))
                    .is_some_and(|n| n.seen <= requested);
                if stale {
                    let pruned = state.cache.prune(parent, &name);
                    self.stats.record_pruned(pruned);
                    debug!(path, "Pruned entry missing on remote");
                }
                Err(FsError::NotFound(p))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn getattr(&self, path: &str) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.getattr(path)
    }

    /// Applies a size change and every other attribute change as one commit.
    /// The remote truncate runs first; nothing is cached if it fails.
    pub async fn setattr(
        &self,
        path: &str,
        size: Option<u64>,
        changes: &AttrChanges,
    ) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        let ino = {
            let state = self.state.lock();
            let ino = state.cache.lookup(path)?;
            if size.is_some() && state.cache.attr(ino)?.kind().is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            ino
        };
        if let Some(size) = size {
            self.call("truncate", self.remote.truncate(path, size))
                .await?;
        }

        let mut state = self.state.lock();
        let mut attr = match size {
            Some(size) => state.cache.set_size(ino, size)?,
            None => state.cache.attr(ino)?,
        };
        if !changes.is_empty() {
            attr = state.cache.apply(ino, changes)?;
        }
        Ok(attr)
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.chmod(path, mode)
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.chown(path, uid, gid)
    }

    pub async fn utimens(&self, path: &str, times: Option<[SystemTime; 2]>) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.utimens(path, times)
    }

    pub async fn chflags(&self, path: &str, flags: u32) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.chflags(path, flags)
    }

    pub async fn setcrtime(&self, path: &str, time: SystemTime) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.setcrtime(path, time)
    }

    pub async fn setchgtime(&self, path: &str, time: SystemTime) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.setchgtime(path, time)
    }

    // ---- structural operations ----

    /// Creates a node remotely and then in the cache. `payload` is the
    /// symlink target for symlinks and initial content for regular files.
    pub async fn create(
        &self,
        path: &str,
        kind: NodeKind,
        perm: u32,
        caller: Caller,
        payload: Option<Vec<u8>>,
    ) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.check_create(path)?;

        match kind {
            NodeKind::Directory => self.call("mkdir", self.remote.create_dir(path)).await?,
            NodeKind::File => {
                self.call("create", self.remote.create_file(path)).await?;
                if let Some(data) = payload.as_deref().filter(|d| !d.is_empty()) {
                    self.push_content(path, data).await?;
                }
            }
            NodeKind::Symlink => {
                let target = payload
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .ok_or_else(|| FsError::InvalidArgument(format!("{path}: no link target")))?;
                self.call("symlink", self.remote.symlink(&target, path))
                    .await?;
            }
        }

        let mut state = self.state.lock();
        let size = payload.as_ref().map_or(0, Vec::len) as u64;
        let stored = if kind == NodeKind::Symlink { payload } else { None };
        let ino = match state.cache.create(path, kind, perm, caller, stored) {
            Ok(ino) => ino,
            // A concurrent lookup discovered the new remote entry first.
            Err(FsError::AlreadyExists(_)) => state.cache.lookup(path)?,
            Err(e) => return Err(e),
        };
        if let Some(node) = state.cache.get_mut(ino) {
            node.attr.size = size;
            node.seen = Instant::now();
        }
        debug!(path, ino, ?kind, "Created");
        state.cache.attr(ino)
    }

    async fn push_content(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let stream = self
            .call("open", self.remote.open(path, OpenMode::ReadWrite))
            .await?;
        let written = self.call("write", stream.write_at(0, data)).await;
        let closed = self.call("close", stream.close()).await;
        self.stats.record_write(data.len() as u64);
        written.and(closed)
    }

    pub async fn mkdir(&self, path: &str, perm: u32, caller: Caller) -> FsResult<NodeAttr> {
        self.create(path, NodeKind::Directory, perm, caller, None)
            .await
    }

    /// Creates an empty regular file (mknod / create).
    pub async fn mknod(&self, path: &str, perm: u32, caller: Caller) -> FsResult<NodeAttr> {
        self.create(path, NodeKind::File, perm, caller, None).await
    }

    pub async fn symlink(&self, target: &str, path: &str, caller: Caller) -> FsResult<NodeAttr> {
        self.create(
            path,
            NodeKind::Symlink,
            0o777,
            caller,
            Some(target.as_bytes().to_vec()),
        )
        .await
    }

    /// Returns the target of a symlink, fetching it remotely on first use.
    pub async fn readlink(&self, path: &str) -> FsResult<Vec<u8>> {
        self.ensure_cached(path).await?;
        let ino = {
            let state = self.state.lock();
            let ino = state.cache.lookup(path)?;
            let node = state
                .cache
                .get(ino)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            if node.kind() != NodeKind::Symlink {
                return Err(FsError::InvalidArgument(format!("{path} is not a symlink")));
            }
            if let Some(target) = node.payload() {
                return Ok(target.to_vec());
            }
            ino
        };
        let target = self
            .call("readlink", self.remote.read_link(path))
            .await?
            .into_bytes();
        if let Some(node) = self.state.lock().cache.get_mut(ino) {
            node.attr.size = target.len() as u64;
            node.payload = Some(target.clone());
        }
        Ok(target)
    }

    /// Fails with `DirectoryNotEmpty` unless the directory at `path` is empty
    /// on the remote. The cached children are not trusted here: the listing
    /// is always refreshed first.
    async fn ensure_empty(&self, path: &str, ino: Ino) -> FsResult<()> {
        if !self.state.lock().cache.get(ino).is_some_and(Node::is_dir) {
            return Ok(());
        }
        if !self.refresh_dir(path, ino).await?.is_empty() {
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }
        Ok(())
    }

    /// Fetches a listing and reconciles `ino` against it. Returns the
    /// reconciled children in listing order, captured before any eviction.
    async fn refresh_dir(&self, path: &str, ino: Ino) -> FsResult<Vec<(String, Ino, NodeKind)>> {
        let requested = Instant::now();
        let listing = self.call("list", self.remote.list(path)).await?;
        let mut state = self.state.lock();
        if !state.cache.get(ino).is_some_and(Node::is_dir) {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        let report = reconcile(&mut state.cache, ino, &listing, requested);
        self.stats.record_inserted(report.inserted + report.replaced);
        self.stats.record_pruned(report.pruned);
        let snapshot = children_of(&state.cache, ino);
        self.maybe_evict(&mut state.cache);
        Ok(snapshot)
    }

    /// Removes `path`. `expect_dir` selects rmdir semantics.
    pub async fn remove(&self, path: &str, expect_dir: bool) -> FsResult<()> {
        self.ensure_cached(path).await?;
        let ino = self.state.lock().cache.check_remove(path, expect_dir)?;
        if expect_dir {
            self.ensure_empty(path, ino).await?;
            self.call("rmdir", self.remote.remove_dir(path)).await?;
        } else {
            self.call("unlink", self.remote.remove_file(path)).await?;
        }

        let mut state = self.state.lock();
        match state.cache.remove(path, expect_dir) {
            Ok(_) | Err(FsError::NotFound(_)) => {
                debug!(path, ino, "Removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        self.remove(path, false).await
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        self.remove(path, true).await
    }

    /// Renames `old_path` to `new_path`, replacing a compatible destination.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        self.ensure_cached(old_path).await?;
        self.ensure_cached(new_path).await?;
        let plan = self.state.lock().cache.check_rename(old_path, new_path)?;
        if plan.noop {
            return Ok(());
        }
        if let Some((target, true)) = plan.replaced {
            self.ensure_empty(new_path, target).await?;
        }

        match plan.replaced {
            Some((_, true)) => self.call("rmdir", self.remote.remove_dir(new_path)).await?,
            Some((_, false)) => {
                self.call("unlink", self.remote.remove_file(new_path))
                    .await?;
            }
            None => {}
        }
        self.call("rename", self.remote.rename(old_path, new_path))
            .await?;

        let mut state = self.state.lock();
        if let Err(e) = state.cache.rename(old_path, new_path) {
            // The remote has moved; drop both names so the next lookup or
            // listing picks up the remote state.
            warn!(old_path, new_path, error = %e, "Rename committed remotely but not in cache");
            for p in [old_path, new_path] {
                if let Ok(Resolved {
                    parent: Some(parent),
                    name,
                    node: Some(_),
                }) = state.cache.resolve(p, None)
                {
                    state.cache.prune(parent, &name);
                }
            }
        }
        debug!(old_path, new_path, ino = plan.source, "Renamed");
        Ok(())
    }

    /// Adds `new_path` as a hard link to `old_path`.
    pub async fn link(&self, old_path: &str, new_path: &str) -> FsResult<NodeAttr> {
        self.ensure_cached(old_path).await?;
        self.ensure_cached(new_path).await?;
        self.state.lock().cache.check_link(old_path, new_path)?;
        self.call("link", self.remote.hard_link(old_path, new_path))
            .await?;
        let mut state = self.state.lock();
        let ino = state.cache.link(old_path, new_path)?;
        state.cache.attr(ino)
    }

    /// Sets the length of a regular file, remotely and then in the cache.
    pub async fn truncate(&self, path: &str, size: u64) -> FsResult<NodeAttr> {
        self.ensure_cached(path).await?;
        let ino = {
            let state = self.state.lock();
            let ino = state.cache.lookup(path)?;
            if state.cache.attr(ino)?.kind().is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            ino
        };
        self.call("truncate", self.remote.truncate(path, size))
            .await?;
        self.state.lock().cache.set_size(ino, size)
    }

    // ---- handles and content ----

    /// Opens a regular file. Openers of the same node share one handle.
    pub async fn open(&self, path: &str, mode: OpenMode) -> FsResult<Handle> {
        self.ensure_cached(path).await?;
        let handle = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let ino = state.cache.lookup(path)?;
            if state.cache.attr(ino)?.kind().is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            let (handle, first) = state.handles.acquire(ino, HandleKind::File)?;
            state.cache.open_ref(ino)?;
            if first {
                self.stats.record_handle_open();
            }
            match state.handles.stream(handle)? {
                Some((_, current)) if current >= mode => return Ok(handle),
                _ => handle,
            }
        };

        match self.attach_stream(handle, path, mode).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                // Undo this open's reference; the error is what matters here.
                let _ = self.release(handle).await;
                Err(e)
            }
        }
    }

    /// Opens a remote stream for `handle` and installs it.
    async fn attach_stream(&self, handle: Handle, path: &str, mode: OpenMode) -> FsResult<()> {
        let stream: Arc<dyn RemoteFile> = self
            .call("open", self.remote.open(path, mode))
            .await?
            .into();
        let loser = self
            .state
            .lock()
            .handles
            .install_stream(handle, stream, mode);
        if let Some(loser) = loser {
            self.close_stream(loser).await;
        }
        Ok(())
    }

    async fn close_stream(&self, stream: Arc<dyn RemoteFile>) {
        if let Err(e) = self.call("close", stream.close()).await {
            warn!(error = %e, "Failed to close remote stream");
        }
    }

    /// Opens a directory for enumeration.
    pub async fn opendir(&self, path: &str) -> FsResult<Handle> {
        self.ensure_cached(path).await?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ino = state.cache.lookup(path)?;
        if !state.cache.attr(ino)?.kind().is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        let (handle, first) = state.handles.acquire(ino, HandleKind::Directory)?;
        state.cache.open_ref(ino)?;
        if first {
            self.stats.record_handle_open();
        }
        Ok(handle)
    }

    /// Drops one reference to a handle. The last release closes the remote
    /// stream and removes the table entry.
    pub async fn release(&self, handle: Handle) -> FsResult<()> {
        let last = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let last = state.handles.release(handle)?;
            let ino = last.as_ref().map_or(handle, HandleEntry::ino);
            state.cache.close_ref(ino);
            last
        };
        if let Some(mut entry) = last {
            self.stats.record_handle_close();
            if let Some(stream) = entry.take_stream() {
                self.call("close", stream.close()).await?;
            }
        }
        Ok(())
    }

    /// Releases a directory handle.
    pub async fn releasedir(&self, handle: Handle) -> FsResult<()> {
        if self.state.lock().handles.get(handle)?.kind() != HandleKind::Directory {
            return Err(FsError::NotADirectory(format!("handle {handle}")));
        }
        self.release(handle).await
    }

    /// Returns the stream for `handle`, upgrading it to read-write if needed.
    async fn stream_for(
        &self,
        handle: Handle,
        mode: OpenMode,
    ) -> FsResult<(Ino, Arc<dyn RemoteFile>)> {
        let (ino, current, path) = {
            let state = self.state.lock();
            let ino = state.handles.get(handle)?.ino();
            (ino, state.handles.stream(handle)?, state.cache.path_of(ino))
        };
        match current {
            Some((stream, current)) if current >= mode => return Ok((ino, stream)),
            _ => {}
        }
        let path = path.ok_or(FsError::InvalidHandle(handle))?;
        self.attach_stream(handle, &path, mode).await?;
        let stream = self
            .state
            .lock()
            .handles
            .stream(handle)?
            .map(|(s, _)| s)
            .ok_or(FsError::InvalidHandle(handle))?;
        Ok((ino, stream))
    }

    /// Reads up to `len` bytes at `offset`, clamped to the cached size.
    pub async fn read(&self, handle: Handle, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let want = {
            let state = self.state.lock();
            let ino = state.handles.get(handle)?.ino();
            let size = state.cache.attr(ino)?.size;
            usize::try_from(size.saturating_sub(offset))
                .map_or(len, |available| available.min(len))
        };
        let data = if want == 0 {
            Vec::new()
        } else {
            let (_, stream) = self.stream_for(handle, OpenMode::Read).await?;
            let mut data = self.call("read", stream.read_at(offset, want)).await?;
            data.truncate(want);
            data
        };

        let state = &mut *self.state.lock();
        if let Some(ino) = state.handles.get(handle).ok().map(HandleEntry::ino)
            && let Some(node) = state.cache.get_mut(ino)
        {
            node.attr.atime = SystemTime::now();
        }
        self.stats.record_read(data.len() as u64);
        Ok(data)
    }

    /// Writes `data` at `offset`. The cached size grows only after the remote
    /// accepted the write.
    pub async fn write(&self, handle: Handle, offset: u64, data: &[u8]) -> FsResult<usize> {
        let (ino, stream) = self.stream_for(handle, OpenMode::ReadWrite).await?;
        let written = self.call("write", stream.write_at(offset, data)).await?;

        let mut state = self.state.lock();
        if let Some(node) = state.cache.get_mut(ino) {
            let end = offset + written as u64;
            if end > node.attr.size {
                node.attr.size = end;
            }
            node.touch_modified(SystemTime::now());
        }
        self.stats.record_write(written as u64);
        Ok(written)
    }

    /// Writes are pushed through on every call; flushing only validates the handle.
    pub fn flush(&self, handle: Handle) -> FsResult<()> {
        self.state.lock().handles.get(handle).map(|_| ())
    }

    pub fn fsync(&self, handle: Handle) -> FsResult<()> {
        self.flush(handle)
    }

    // ---- directory listing ----

    /// Enumerates a directory handle.
    ///
    /// At `offset` 0 the directory is first reconciled against a fresh remote
    /// listing and the resulting order is captured on the handle. Entries are
    /// `.` (offset 1), `..` (offset 2) and the children (offset 3 onward);
    /// only entries past `offset` are passed to `fill`, which returns `false`
    /// to stop early.
    pub async fn readdir(
        &self,
        handle: Handle,
        offset: i64,
        mut fill: impl FnMut(&DirEntry) -> bool,
    ) -> FsResult<()> {
        let (ino, path) = {
            let state = self.state.lock();
            let entry = state.handles.get(handle)?;
            if entry.kind() != HandleKind::Directory {
                return Err(FsError::NotADirectory(format!("handle {handle}")));
            }
            (entry.ino(), state.cache.path_of(entry.ino()))
        };

        if offset == 0 {
            // A detached directory has no remote counterpart left to list.
            let snapshot = match &path {
                Some(path) => self.refresh_dir(path, ino).await?,
                None => children_of(&self.state.lock().cache, ino),
            };
            self.state.lock().handles.set_listing(handle, snapshot)?;
        }

        let entries: Vec<DirEntry> = {
            let state = self.state.lock();
            let parent = state
                .cache
                .get(ino)
                .and_then(|n| n.links.first().map(|(p, _)| *p))
                .unwrap_or(ROOT_INO);
            let mut entries = vec![
                DirEntry {
                    name: ".".to_string(),
                    ino,
                    kind: NodeKind::Directory,
                    attr: state.cache.attr(ino).ok(),
                    offset: 1,
                },
                DirEntry {
                    name: "..".to_string(),
                    ino: parent,
                    kind: NodeKind::Directory,
                    attr: state.cache.attr(parent).ok(),
                    offset: 2,
                },
            ];
            let listing = state.handles.listing(handle)?;
            entries.extend(listing.iter().zip(3_i64..).map(|((name, child, kind), off)| {
                DirEntry {
                    name: name.clone(),
                    ino: *child,
                    kind: *kind,
                    attr: state.cache.attr(*child).ok(),
                    offset: off,
                }
            }));
            entries
        };

        for entry in entries.iter().filter(|e| e.offset > offset) {
            if !fill(entry) {
                break;
            }
        }
        Ok(())
    }

    /// Opens, fully enumerates and releases a directory. `.` and `..` are
    /// omitted.
    pub async fn list_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let handle = self.opendir(path).await?;
        let mut out = Vec::new();
        let listed = self
            .readdir(handle, 0, |entry| {
                if entry.offset > 2 {
                    out.push(entry.clone());
                }
                true
            })
            .await;
        self.releasedir(handle).await?;
        listed.map(|()| out)
    }

    // ---- extended attributes ----

    pub async fn setxattr(
        &self,
        path: &str,
        name: &str,
        value: &[u8],
        mode: XattrMode,
    ) -> FsResult<()> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.setxattr(path, name, value, mode)
    }

    pub async fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.getxattr(path, name)
    }

    pub async fn removexattr(&self, path: &str, name: &str) -> FsResult<()> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.removexattr(path, name)
    }

    /// Enumerates attribute names; `fill` returns `false` to report that the
    /// caller's buffer is exhausted (`OutOfRange`).
    pub async fn listxattr(&self, path: &str, fill: impl FnMut(&str) -> bool) -> FsResult<()> {
        self.ensure_cached(path).await?;
        self.state.lock().cache.listxattr(path, fill)
    }

    // ---- shutdown ----

    /// Closes every stream still open and then the remote session. Called
    /// once when the mount goes away; handles are invalid afterwards.
    pub async fn shutdown(&self) -> FsResult<()> {
        let leftover = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let entries = state.handles.drain();
            for entry in &entries {
                for _ in 0..entry.refs() {
                    state.cache.close_ref(entry.ino());
                }
            }
            entries
        };
        if !leftover.is_empty() {
            debug!(handles = leftover.len(), "Closing handles left open at shutdown");
        }
        for mut entry in leftover {
            self.stats.record_handle_close();
            if let Some(stream) = entry.take_stream() {
                self.close_stream(stream).await;
            }
        }
        self.call("close", self.remote.close()).await
    }

    // ---- capacity ----

    /// Capacity of the remote, or [`FALLBACK_CAPACITY`] if it cannot say.
    pub async fn statfs(&self, path: &str) -> FsResult<Capacity> {
        match self.call("statfs", self.remote.capacity(path)).await {
            Ok(Some(capacity)) => Ok(capacity),
            Ok(None) => Ok(FALLBACK_CAPACITY),
            Err(e) => {
                debug!(error = %e, "Capacity query failed, using defaults");
                Ok(FALLBACK_CAPACITY)
            }
        }
    }
}

fn children_of(cache: &NodeCache, ino: Ino) -> Vec<(String, Ino, NodeKind)> {
    cache
        .get(ino)
        .and_then(|n| n.children.as_ref())
        .map(|c| {
            c.iter()
                .filter_map(|(n, i)| cache.get(*i).map(|child| (n.clone(), *i, child.kind())))
                .collect()
        })
        .unwrap_or_default()
}
