//! fuser `Filesystem` implementation over the operation dispatcher.
//!
//! The kernel addresses nodes by inode; the dispatcher works on paths. Every
//! callback turns its inode (or parent inode plus name) into a path through
//! the node arena, runs the matching dispatcher verb on the tokio runtime via
//! the async bridge and replies with the result or its errno.
//!
//! Inodes handed to the kernel in entry replies are pinned with
//! [`Dispatcher::remember`] so that removed or pruned nodes stay addressable
//! until the kernel forgets them.
//!
//! Directory handles are shared per inode in the dispatcher, so each kernel
//! `opendir` gets its own file handle here with a private listing snapshot.
//! Two readers of one directory never page through each other's snapshot.

use crate::async_bridge::{self, BridgeStats};
use crate::config::MountConfig;
use crate::error::{FuseError, FuseResult};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use sftpfs_core::node::{PERM_MASK, S_IFMT, S_IFREG};
use sftpfs_core::{
    AttrChanges, Caller, DirEntry, Dispatcher, FsError, FsResult, MountStats, NodeAttr,
    NodeKind, OpenMode, RemoteStore, XattrMode, path,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, trace, warn};

/// Preferred I/O size reported in attributes.
const BLOCK_SIZE: u32 = 4096;

#[cfg(target_os = "linux")]
const RENAME_NOREPLACE: u32 = 1;
#[cfg(target_os = "linux")]
const RENAME_EXCHANGE: u32 = 2;
#[cfg(target_os = "macos")]
const RENAME_NOREPLACE: u32 = 0x4;
#[cfg(target_os = "macos")]
const RENAME_EXCHANGE: u32 = 0x2;

/// Unwraps a `Result<T, errno>` or replies with the errno and returns.
macro_rules! try_reply {
    ($reply:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(errno) => {
                $reply.error(errno);
                return;
            }
        }
    };
}

/// One kernel directory stream.
#[derive(Debug)]
struct DirCursor {
    /// Shared dispatcher handle of the directory.
    handle: sftpfs_core::Handle,
    /// Entries captured by the last offset-0 read.
    entries: Vec<DirEntry>,
}

/// FUSE filesystem backed by a remote store.
pub struct SftpFs {
    /// Runtime the dispatcher futures run on.
    handle: Handle,
    /// Owned runtime, if we built one. Declared after `handle` so it drops last.
    _owned_runtime: Option<Runtime>,
    config: MountConfig,
    bridge_stats: Arc<BridgeStats>,
    dispatcher: Arc<Dispatcher>,
    dir_cursors: HashMap<u64, DirCursor>,
    next_dir_fh: u64,
}

impl std::fmt::Debug for SftpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFs")
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SftpFs {
    /// Creates a filesystem over `remote` with the default (network)
    /// configuration and a runtime of its own.
    pub fn new(remote: Arc<dyn RemoteStore>) -> FuseResult<Self> {
        Self::with_config(remote, MountConfig::default())
    }

    pub fn with_config(remote: Arc<dyn RemoteStore>, config: MountConfig) -> FuseResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sftpfs-io")
            .build()
            .map_err(|e| {
                FuseError::Io(std::io::Error::other(format!(
                    "failed to create tokio runtime: {e}"
                )))
            })?;
        let handle = runtime.handle().clone();
        Ok(Self::with_runtime_internal(
            remote,
            Some(runtime),
            handle,
            config,
        ))
    }

    /// Creates a filesystem that runs on an existing runtime, which must
    /// outlive it.
    pub fn with_runtime_handle(
        remote: Arc<dyn RemoteStore>,
        handle: Handle,
        config: MountConfig,
    ) -> Self {
        Self::with_runtime_internal(remote, None, handle, config)
    }

    fn with_runtime_internal(
        remote: Arc<dyn RemoteStore>,
        owned_runtime: Option<Runtime>,
        handle: Handle,
        config: MountConfig,
    ) -> Self {
        let owner = Caller::current();
        info!(
            remote = %remote.describe(),
            uid = owner.uid,
            gid = owner.gid,
            attr_ttl_secs = config.cache.attr_ttl.as_secs(),
            max_nodes = config.cache.max_nodes,
            io_timeout_secs = config.io_timeout.as_secs(),
            read_only = config.read_only,
            "SftpFs initialized"
        );
        let dispatcher = Arc::new(Dispatcher::new(remote, config.cache.clone(), owner));
        Self {
            handle,
            _owned_runtime: owned_runtime,
            config,
            bridge_stats: BridgeStats::new(),
            dispatcher,
            dir_cursors: HashMap::new(),
            next_dir_fh: 1,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> Arc<MountStats> {
        Arc::clone(self.dispatcher.stats())
    }

    pub fn bridge_stats(&self) -> &BridgeStats {
        &self.bridge_stats
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Runs a dispatcher verb on the runtime, bounded by the I/O timeout.
    fn exec<F, Fut, T>(&self, op: F) -> Result<T, c_int>
    where
        F: FnOnce(Arc<Dispatcher>) -> Fut,
        Fut: Future<Output = FsResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let future = op(Arc::clone(&self.dispatcher));
        async_bridge::execute_fs(
            &self.handle,
            self.config.io_timeout,
            Some(&self.bridge_stats),
            future,
        )
    }

    fn writable(&self) -> Result<(), c_int> {
        if self.config.read_only {
            Err(libc::EROFS)
        } else {
            Ok(())
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.dispatcher.path_of(ino).map_err(|e| e.errno())
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(path::join(&self.path_of(parent)?, name))
    }

    /// Opens a directory stream with its own file handle.
    fn open_dir_stream(&mut self, path: String) -> Result<u64, c_int> {
        let handle = self.exec(move |d| async move { d.opendir(&path).await })?;
        let fh = self.next_dir_fh;
        self.next_dir_fh += 1;
        self.dir_cursors.insert(
            fh,
            DirCursor {
                handle,
                entries: Vec::new(),
            },
        );
        Ok(fh)
    }

    /// Entries of stream `fh` past `offset`. Offset 0 takes a fresh snapshot
    /// for this stream only.
    fn dir_stream_entries(&mut self, fh: u64, offset: i64) -> Result<Vec<DirEntry>, c_int> {
        let handle = self.dir_cursors.get(&fh).ok_or(libc::EBADF)?.handle;
        if offset == 0 {
            let entries = self.exec(move |d| async move {
                let mut entries = Vec::new();
                d.readdir(handle, 0, |entry| {
                    entries.push(entry.clone());
                    true
                })
                .await?;
                Ok(entries)
            })?;
            if let Some(cursor) = self.dir_cursors.get_mut(&fh) {
                cursor.entries = entries;
            }
        }
        let cursor = self.dir_cursors.get(&fh).ok_or(libc::EBADF)?;
        Ok(cursor
            .entries
            .iter()
            .filter(|e| e.offset > offset)
            .cloned()
            .collect())
    }

    fn close_dir_stream(&mut self, fh: u64) -> Result<(), c_int> {
        let cursor = self.dir_cursors.remove(&fh).ok_or(libc::EBADF)?;
        self.exec(move |d| async move { d.releasedir(cursor.handle).await })
    }

    /// Replies with an entry the kernel will hold a lookup reference on.
    fn reply_entry(&self, reply: ReplyEntry, attr: &NodeAttr) {
        self.dispatcher.remember(attr.ino);
        reply.entry(&self.config.entry_ttl, &file_attr(attr), 0);
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
        NodeKind::Symlink => FileType::Symlink,
    }
}

fn file_attr(attr: &NodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: file_type(attr.kind()),
        perm: u16::try_from(attr.perm()).unwrap_or(0o777),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: attr.flags,
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Permission bits for a new regular file. Device nodes, FIFOs and sockets
/// have no remote counterpart.
fn regular_perm(mode: u32, umask: u32) -> Result<u32, c_int> {
    match mode & S_IFMT {
        0 | S_IFREG => Ok(mode & !umask & PERM_MASK),
        _ => Err(libc::ENOTSUP),
    }
}

fn open_mode(flags: i32) -> OpenMode {
    if flags & libc::O_ACCMODE == libc::O_RDONLY {
        OpenMode::Read
    } else {
        OpenMode::ReadWrite
    }
}

/// Decides how an xattr-style reply fits a caller buffer of `size` bytes:
/// `Some(len)` reports the needed size, `None` sends the data.
fn xattr_fit(len: usize, size: u32) -> Result<Option<u32>, c_int> {
    let len = u32::try_from(len).map_err(|_| libc::E2BIG)?;
    if size == 0 {
        Ok(Some(len))
    } else if len > size {
        Err(libc::ERANGE)
    } else {
        Ok(None)
    }
}

fn reply_xattr(reply: ReplyXattr, data: &[u8], size: u32) {
    match xattr_fit(data.len(), size) {
        Ok(Some(len)) => reply.size(len),
        Ok(None) => reply.data(data),
        Err(errno) => reply.error(errno),
    }
}

impl Filesystem for SftpFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        info!(
            remote = %self.dispatcher.remote().describe(),
            "FUSE filesystem initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.dir_cursors.clear();
        if let Err(errno) = self.exec(|d| async move { d.shutdown().await }) {
            warn!(errno, "Remote session did not close cleanly");
        }
        let stats = self.dispatcher.stats().snapshot();
        info!(
            remote_calls = stats.remote_calls,
            remote_errors = stats.remote_errors,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            nodes_inserted = stats.nodes_inserted,
            nodes_pruned = stats.nodes_pruned,
            nodes_evicted = stats.nodes_evicted,
            uptime_secs = stats.uptime_secs,
            "FUSE filesystem destroyed"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = try_reply!(reply, self.child_path(parent, name));
        trace!(parent = parent, path = %path, "lookup");
        let attr = try_reply!(
            reply,
            self.exec(move |d| async move { d.lookup(&path).await })
        );
        self.reply_entry(reply, &attr);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup = nlookup, "forget");
        self.dispatcher.forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuser::fuse_forget_one]) {
        trace!(count = nodes.len(), "batch_forget");
        for node in nodes {
            self.dispatcher.forget(node.nodeid, node.nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        match self.dispatcher.getattr_ino(ino) {
            Ok(attr) => reply.attr(&self.config.entry_ttl, &file_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, mode = ?mode, size = ?size, "setattr");
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.path_of(ino));
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
            crtime,
            chgtime: chgtime.or(ctime),
            flags,
        };
        let attr = try_reply!(
            reply,
            self.exec(move |d| async move { d.setattr(&path, size, &changes).await })
        );
        reply.attr(&self.config.entry_ttl, &file_attr(&attr));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(inode = ino, "readlink");
        let path = try_reply!(reply, self.path_of(ino));
        let target = try_reply!(
            reply,
            self.exec(move |d| async move { d.readlink(&path).await })
        );
        reply.data(&target);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.child_path(parent, name));
        trace!(path = %path, mode = mode, "mknod");
        let perm = try_reply!(reply, regular_perm(mode, umask));
        let caller = Caller::new(req.uid(), req.gid());
        let attr = try_reply!(
            reply,
            self.exec(move |d| async move { d.mknod(&path, perm, caller).await })
        );
        self.reply_entry(reply, &attr);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.child_path(parent, name));
        trace!(path = %path, mode = mode, "mkdir");
        let perm = mode & !umask & PERM_MASK;
        let caller = Caller::new(req.uid(), req.gid());
        let attr = try_reply!(
            reply,
            self.exec(move |d| async move { d.mkdir(&path, perm, caller).await })
        );
        self.reply_entry(reply, &attr);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.child_path(parent, name));
        trace!(path = %path, "unlink");
        try_reply!(
            reply,
            self.exec(move |d| async move { d.unlink(&path).await })
        );
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.child_path(parent, name));
        trace!(path = %path, "rmdir");
        try_reply!(
            reply,
            self.exec(move |d| async move { d.rmdir(&path).await })
        );
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.child_path(parent, link_name));
        let target = try_reply!(reply, target.to_str().ok_or(libc::EINVAL)).to_string();
        trace!(path = %path, target = %target, "symlink");
        let caller = Caller::new(req.uid(), req.gid());
        let attr = try_reply!(
            reply,
            self.exec(move |d| async move { d.symlink(&target, &path, caller).await })
        );
        self.reply_entry(reply, &attr);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        try_reply!(reply, self.writable());
        let from = try_reply!(reply, self.child_path(parent, name));
        let to = try_reply!(reply, self.child_path(newparent, newname));
        trace!(from = %from, to = %to, flags = flags, "rename");
        if flags & RENAME_EXCHANGE != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let no_replace = flags & RENAME_NOREPLACE != 0;
        try_reply!(
            reply,
            self.exec(move |d| async move {
                if no_replace {
                    match d.lookup(&to).await {
                        Ok(_) => return Err(FsError::AlreadyExists(to)),
                        Err(FsError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                d.rename(&from, &to).await
            })
        );
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        try_reply!(reply, self.writable());
        let from = try_reply!(reply, self.path_of(ino));
        let to = try_reply!(reply, self.child_path(newparent, newname));
        trace!(from = %from, to = %to, "link");
        let attr = try_reply!(
            reply,
            self.exec(move |d| async move { d.link(&from, &to).await })
        );
        self.reply_entry(reply, &attr);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags = flags, "open");
        let mode = open_mode(flags);
        if mode == OpenMode::ReadWrite {
            try_reply!(reply, self.writable());
        }
        let path = try_reply!(reply, self.path_of(ino));
        let fh = try_reply!(
            reply,
            self.exec(move |d| async move { d.open(&path, mode).await })
        );
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, size = size, "read");
        let offset = try_reply!(reply, u64::try_from(offset).map_err(|_| libc::EINVAL));
        let len = size as usize;
        let data = try_reply!(
            reply,
            self.exec(move |d| async move { d.read(fh, offset, len).await })
        );
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, len = data.len(), "write");
        try_reply!(reply, self.writable());
        let offset = try_reply!(reply, u64::try_from(offset).map_err(|_| libc::EINVAL));
        let data = data.to_vec();
        let written = try_reply!(
            reply,
            self.exec(move |d| async move { d.write(fh, offset, &data).await })
        );
        reply.written(u32::try_from(written).unwrap_or(u32::MAX));
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh = fh, "flush");
        match self.dispatcher.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh = fh, "release");
        try_reply!(
            reply,
            self.exec(move |d| async move { d.release(fh).await })
        );
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!(inode = ino, fh = fh, datasync = datasync, "fsync");
        match self.dispatcher.fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        let path = try_reply!(reply, self.path_of(ino));
        let fh = try_reply!(reply, self.open_dir_stream(path));
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, fh = fh, offset = offset, "readdir");
        let entries = try_reply!(reply, self.dir_stream_entries(fh, offset));
        for entry in &entries {
            if reply.add(entry.ino, entry.offset, file_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh = fh, "releasedir");
        try_reply!(reply, self.close_dir_stream(fh));
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh = fh, "fsyncdir");
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        trace!(inode = ino, "statfs");
        let path = self.path_of(ino).unwrap_or_else(|_| "/".to_string());
        let capacity = try_reply!(
            reply,
            self.exec(move |d| async move { d.statfs(&path).await })
        );
        reply.statfs(
            capacity.blocks,
            capacity.blocks_free,
            capacity.blocks_available,
            capacity.files,
            capacity.files_free,
            capacity.block_size,
            capacity.name_max,
            capacity.fragment_size,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.path_of(ino));
        let name = try_reply!(reply, name.to_str().ok_or(libc::EINVAL)).to_string();
        trace!(path = %path, name = %name, len = value.len(), "setxattr");
        if position != 0 {
            reply.error(libc::ENOTSUP);
            return;
        }
        let mode = if flags & libc::XATTR_CREATE != 0 {
            XattrMode::Create
        } else if flags & libc::XATTR_REPLACE != 0 {
            XattrMode::Replace
        } else {
            XattrMode::Any
        };
        let value = value.to_vec();
        try_reply!(
            reply,
            self.exec(move |d| async move { d.setxattr(&path, &name, &value, mode).await })
        );
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = try_reply!(reply, self.path_of(ino));
        let name = try_reply!(reply, name.to_str().ok_or(libc::EINVAL)).to_string();
        trace!(path = %path, name = %name, size = size, "getxattr");
        let value = try_reply!(
            reply,
            self.exec(move |d| async move { d.getxattr(&path, &name).await })
        );
        reply_xattr(reply, &value, size);
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.path_of(ino));
        trace!(path = %path, size = size, "listxattr");
        let names = try_reply!(
            reply,
            self.exec(move |d| async move {
                let mut buf = Vec::new();
                d.listxattr(&path, |name| {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                    true
                })
                .await?;
                Ok(buf)
            })
        );
        reply_xattr(reply, &names, size);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.path_of(ino));
        let name = try_reply!(reply, name.to_str().ok_or(libc::EINVAL)).to_string();
        trace!(path = %path, name = %name, "removexattr");
        try_reply!(
            reply,
            self.exec(move |d| async move { d.removexattr(&path, &name).await })
        );
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask = mask, "access");
        if let Err(e) = self.dispatcher.getattr_ino(ino) {
            reply.error(e.errno());
            return;
        }
        if mask & libc::W_OK != 0 && self.config.read_only {
            reply.error(libc::EROFS);
            return;
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        try_reply!(reply, self.writable());
        let path = try_reply!(reply, self.child_path(parent, name));
        trace!(path = %path, mode = mode, flags = flags, "create");
        let perm = try_reply!(reply, regular_perm(mode, umask));
        let caller = Caller::new(req.uid(), req.gid());
        let open = open_mode(flags);
        let (attr, fh) = try_reply!(
            reply,
            self.exec(move |d| async move {
                let attr = d.mknod(&path, perm, caller).await?;
                let fh = d.open(&path, open).await?;
                Ok((attr, fh))
            })
        );
        debug!(inode = attr.ino, fh = fh, "Created and opened file");
        self.dispatcher.remember(attr.ino);
        reply.created(&self.config.entry_ttl, &file_attr(&attr), 0, fh, 0);
    }
}
