//! Node cache: the in-memory mirror of the remote namespace.
//!
//! Nodes live in an arena keyed by inode number. Directories map child names
//! to inodes; every node records the `(parent, name)` links naming it, which
//! gives O(1) parent lookup for path reconstruction and for rename's cycle
//! guard.
//!
//! # Lifetimes
//!
//! A node leaves the tree through unlink, rmdir, replacement by rename,
//! reconciliation pruning, or eviction. If it is still open or still known to
//! the kernel at that point it stays in the arena, detached, until the last
//! [`close_ref`](NodeCache::close_ref) or [`forget`](NodeCache::forget).
//! Inode numbers are allocated monotonically and never reused.
//!
//! All methods are synchronous and CPU-bound; the dispatcher calls them while
//! holding its state lock.

use crate::config::CacheConfig;
use crate::error::{FsError, FsResult};
use crate::node::{Ino, Node, NodeAttr, NodeKind, PERM_MASK, ROOT_INO, S_IFMT, UNSET_ID};
use crate::path::{self, NAME_MAX};
use crate::remote::{RemoteEntry, RemoteKind};
use std::collections::HashMap;
use std::time::{Instant, SystemTime};
use tracing::trace;

/// Extended attribute reserved by macOS for resource forks. Always rejected.
pub const RESERVED_XATTR: &str = "com.apple.ResourceFork";

/// Identity of the process issuing a request, used for new node ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
}

impl Caller {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The identity of the current process.
    #[cfg(unix)]
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Result of walking a path through the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Directory holding the final component; `None` for the root.
    pub parent: Option<Ino>,
    /// Final component (empty for the root).
    pub name: String,
    /// The node itself, if cached.
    pub node: Option<Ino>,
}

/// How `setxattr` treats an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrMode {
    /// Create or overwrite.
    Any,
    /// Fail if the attribute already exists.
    Create,
    /// Fail if the attribute does not exist.
    Replace,
}

/// A set of attribute changes committed together.
///
/// `None` leaves a field unchanged. Size is handled by the dispatcher since it
/// must reach the remote first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub crtime: Option<SystemTime>,
    pub chgtime: Option<SystemTime>,
    pub flags: Option<u32>,
}

impl AttrChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a validated rename will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    pub source: Ino,
    pub source_is_dir: bool,
    /// Node currently at the destination, and whether it is a directory.
    pub replaced: Option<(Ino, bool)>,
    /// Source and destination already name the same node.
    pub noop: bool,
}

/// The node arena.
#[derive(Debug)]
pub struct NodeCache {
    nodes: HashMap<Ino, Node>,
    next_ino: Ino,
    owner: Caller,
    config: CacheConfig,
}

impl NodeCache {
    /// Creates a cache holding only the root directory, owned by `owner`.
    pub fn new(config: CacheConfig, owner: Caller) -> Self {
        let attr = NodeAttr::new(
            ROOT_INO,
            NodeKind::Directory,
            config.default_dir_mode,
            owner.uid,
            owner.gid,
            SystemTime::now(),
        );
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(attr));
        Self {
            nodes,
            next_ino: ROOT_INO + 1,
            owner,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of nodes in the arena, detached ones included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, ino: Ino) -> Option<&Node> {
        self.nodes.get(&ino)
    }

    pub(crate) fn get_mut(&mut self, ino: Ino) -> Option<&mut Node> {
        self.nodes.get_mut(&ino)
    }

    fn node(&self, ino: Ino) -> FsResult<&Node> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    fn node_mut(&mut self, ino: Ino) -> FsResult<&mut Node> {
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    /// Attributes of a node by inode.
    pub fn attr(&self, ino: Ino) -> FsResult<NodeAttr> {
        Ok(self.node(ino)?.attr)
    }

    /// Child of a directory by name.
    pub fn child(&self, parent: Ino, name: &str) -> Option<Ino> {
        self.nodes.get(&parent)?.child(name)
    }

    // ---- resolution ----

    /// Walks `path` from the root.
    ///
    /// Fails with `NameTooLong` for an over-long component, `NotFound` if an
    /// intermediate directory is not cached and `NotADirectory` if one is not a
    /// directory. If `ancestor` is reached before the final component the walk
    /// fails with `InvalidArgument`: the path runs through that node's subtree.
    pub fn resolve(&self, path: &str, ancestor: Option<Ino>) -> FsResult<Resolved> {
        let parts: Vec<&str> = path::components(path).collect();
        let Some((last, dirs)) = parts.split_last() else {
            return Ok(Resolved {
                parent: None,
                name: String::new(),
                node: Some(ROOT_INO),
            });
        };

        let mut current = ROOT_INO;
        if ancestor == Some(ROOT_INO) {
            return Err(FsError::InvalidArgument(format!(
                "{path} is inside the source subtree"
            )));
        }
        for (i, part) in dirs.iter().enumerate() {
            path::check_name(part)?;
            let node = self.node(current)?;
            if !node.is_dir() {
                return Err(FsError::NotADirectory(prefix(&parts, i)));
            }
            current = node
                .child(part)
                .ok_or_else(|| FsError::NotFound(prefix(&parts, i + 1)))?;
            if ancestor == Some(current) {
                return Err(FsError::InvalidArgument(format!(
                    "{path} is inside the source subtree"
                )));
            }
        }

        path::check_name(last)?;
        let parent = self.node(current)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(prefix(&parts, dirs.len())));
        }
        Ok(Resolved {
            parent: Some(current),
            name: (*last).to_string(),
            node: parent.child(last),
        })
    }

    /// Resolves `path` to an existing node.
    pub fn lookup(&self, path: &str) -> FsResult<Ino> {
        self.resolve(path, None)?
            .node
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Reconstructs the path of an attached node. `None` for detached nodes.
    pub fn path_of(&self, ino: Ino) -> Option<String> {
        let mut names = Vec::new();
        let mut current = ino;
        while current != ROOT_INO {
            let (parent, name) = self.nodes.get(&current)?.links.first()?;
            names.push(name.as_str());
            current = *parent;
            // Directories have a single parent, so the walk is bounded by depth.
            if names.len() > self.nodes.len() {
                return None;
            }
        }
        names.reverse();
        Some(format!("/{}", names.join("/")))
    }

    fn allocate(&mut self) -> Ino {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn attach(&mut self, parent: Ino, name: &str, child: Ino) {
        if let Some(children) = self
            .nodes
            .get_mut(&parent)
            .and_then(|p| p.children.as_mut())
        {
            children.insert(name.to_string(), child);
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.links.push((parent, name.to_string()));
        }
    }

    /// Removes the `(parent, name)` link. Returns the child inode.
    fn detach(&mut self, parent: Ino, name: &str) -> Option<Ino> {
        let child = self
            .nodes
            .get_mut(&parent)
            .and_then(|p| p.children.as_mut())
            .and_then(|c| c.shift_remove(name))?;
        if let Some(node) = self.nodes.get_mut(&child) {
            node.links.retain(|(p, n)| !(*p == parent && n == name));
        }
        Some(child)
    }

    fn touch_parent(&mut self, parent: Ino, now: SystemTime) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.touch_modified(now);
        }
    }

    /// Drops a node that has no links and no references. Directory children
    /// are detached recursively. Returns how many nodes were dropped.
    fn collect(&mut self, ino: Ino) -> u64 {
        let Some(node) = self.nodes.get(&ino) else {
            return 0;
        };
        if ino == ROOT_INO || !node.links.is_empty() || node.is_referenced() {
            return 0;
        }
        let mut dropped = 0;
        if let Some(node) = self.nodes.remove(&ino) {
            dropped += 1;
            for (name, child) in node.children.into_iter().flatten() {
                if let Some(c) = self.nodes.get_mut(&child) {
                    c.links.retain(|(p, n)| !(*p == ino && *n == name));
                }
                dropped += self.collect(child);
            }
        }
        dropped
    }

    /// Detaches `(parent, name)` and everything below it that nothing else
    /// links to. Referenced nodes stay addressable by inode.
    pub(crate) fn prune(&mut self, parent: Ino, name: &str) -> u64 {
        let Some(child) = self.detach(parent, name) else {
            return 0;
        };
        if let Some(node) = self.nodes.get_mut(&child) {
            node.attr.nlink = node.attr.nlink.saturating_sub(1);
        }
        self.release_subtree(child)
    }

    fn release_subtree(&mut self, ino: Ino) -> u64 {
        let Some(node) = self.nodes.get(&ino) else {
            return 0;
        };
        if !node.links.is_empty() {
            return 0;
        }
        if node.is_referenced() {
            // Keep the orphan itself but let go of its children.
            let children: Vec<(String, Ino)> = node
                .children
                .iter()
                .flatten()
                .map(|(n, i)| (n.clone(), *i))
                .collect();
            let mut dropped = 0;
            for (name, _) in children {
                dropped += self.prune(ino, &name);
            }
            if let Some(n) = self.nodes.get_mut(&ino) {
                n.listed = false;
            }
            return dropped;
        }
        self.collect(ino)
    }

    // ---- structural operations ----

    /// Validates that `path` can be created. Returns the parent and name.
    pub fn check_create(&self, path: &str) -> FsResult<(Ino, String)> {
        let r = self.resolve(path, None)?;
        let parent = r
            .parent
            .ok_or_else(|| FsError::AlreadyExists(path.to_string()))?;
        if r.node.is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        Ok((parent, r.name))
    }

    /// Creates a node at `path`.
    pub fn create(
        &mut self,
        path: &str,
        kind: NodeKind,
        perm: u32,
        caller: Caller,
        payload: Option<Vec<u8>>,
    ) -> FsResult<Ino> {
        let (parent, name) = self.check_create(path)?;
        let now = SystemTime::now();
        let ino = self.allocate();
        let mut node = Node::new(NodeAttr::new(ino, kind, perm, caller.uid, caller.gid, now));
        if let Some(payload) = payload {
            node.attr.size = payload.len() as u64;
            node.payload = Some(payload);
        }
        // A fresh directory has nothing remote to list.
        node.listed = kind.is_dir();
        self.nodes.insert(ino, node);
        self.attach(parent, &name, ino);
        self.touch_parent(parent, now);
        trace!(path, ino, ?kind, "Created node");
        Ok(ino)
    }

    /// Validates that `path` can be removed. Returns its inode.
    pub fn check_remove(&self, path: &str, expect_dir: bool) -> FsResult<Ino> {
        let r = self.resolve(path, None)?;
        let ino = r.node.ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if r.parent.is_none() {
            return Err(FsError::NotPermitted(path.to_string()));
        }
        check_replaceable(self.node(ino)?, path, expect_dir)?;
        Ok(ino)
    }

    /// Removes the node at `path`.
    pub fn remove(&mut self, path: &str, expect_dir: bool) -> FsResult<Ino> {
        let ino = self.check_remove(path, expect_dir)?;
        let r = self.resolve(path, None)?;
        let parent = r.parent.ok_or_else(|| FsError::NotPermitted(path.to_string()))?;
        self.unlink_entry(parent, &r.name, SystemTime::now());
        trace!(path, ino, "Removed node");
        Ok(ino)
    }

    fn unlink_entry(&mut self, parent: Ino, name: &str, now: SystemTime) {
        if let Some(ino) = self.detach(parent, name) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.attr.nlink = node.attr.nlink.saturating_sub(1);
                node.attr.ctime = now;
            }
            self.collect(ino);
        }
        self.touch_parent(parent, now);
    }

    /// Validates a rename and describes what it will do.
    pub fn check_rename(&self, old_path: &str, new_path: &str) -> FsResult<RenamePlan> {
        let old = self.resolve(old_path, None)?;
        let source = old
            .node
            .ok_or_else(|| FsError::NotFound(old_path.to_string()))?;
        if old.parent.is_none() {
            return Err(FsError::NotPermitted(old_path.to_string()));
        }
        let source_is_dir = self.node(source)?.is_dir();

        let new = self.resolve(new_path, Some(source))?;
        if new.parent.is_none() {
            return Err(FsError::InvalidArgument(new_path.to_string()));
        }
        if (old.parent == new.parent && old.name == new.name) || new.node == Some(source) {
            return Ok(RenamePlan {
                source,
                source_is_dir,
                replaced: None,
                noop: true,
            });
        }

        let replaced = match new.node {
            Some(target) => {
                check_replaceable(self.node(target)?, new_path, source_is_dir)?;
                Some((target, source_is_dir))
            }
            None => None,
        };
        Ok(RenamePlan {
            source,
            source_is_dir,
            replaced,
            noop: false,
        })
    }

    /// Moves the node at `old_path` to `new_path`, replacing any compatible
    /// destination. The node keeps its inode, attributes and content.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> FsResult<RenamePlan> {
        let plan = self.check_rename(old_path, new_path)?;
        if plan.noop {
            return Ok(plan);
        }
        let old = self.resolve(old_path, None)?;
        let new = self.resolve(new_path, Some(plan.source))?;
        let (Some(old_parent), Some(new_parent)) = (old.parent, new.parent) else {
            return Err(FsError::InvalidArgument(new_path.to_string()));
        };
        let now = SystemTime::now();
        if plan.replaced.is_some() {
            self.unlink_entry(new_parent, &new.name, now);
        }
        self.detach(old_parent, &old.name);
        self.attach(new_parent, &new.name, plan.source);
        if let Some(node) = self.nodes.get_mut(&plan.source) {
            node.attr.ctime = now;
        }
        self.touch_parent(old_parent, now);
        self.touch_parent(new_parent, now);
        trace!(old_path, new_path, ino = plan.source, "Renamed node");
        Ok(plan)
    }

    /// Validates a hard link. Returns the source inode, new parent and name.
    pub fn check_link(&self, old_path: &str, new_path: &str) -> FsResult<(Ino, Ino, String)> {
        let source = self.lookup(old_path)?;
        if self.node(source)?.is_dir() {
            return Err(FsError::NotPermitted(format!(
                "{old_path}: hard links to directories"
            )));
        }
        let (parent, name) = self.check_create(new_path)?;
        Ok((source, parent, name))
    }

    /// Adds `new_path` as another name for the node at `old_path`.
    pub fn link(&mut self, old_path: &str, new_path: &str) -> FsResult<Ino> {
        let (source, parent, name) = self.check_link(old_path, new_path)?;
        let now = SystemTime::now();
        self.attach(parent, &name, source);
        let node = self.node_mut(source)?;
        node.attr.nlink += 1;
        node.attr.ctime = now;
        self.touch_parent(parent, now);
        Ok(source)
    }

    // ---- attribute operations ----

    pub fn getattr(&self, path: &str) -> FsResult<NodeAttr> {
        self.attr(self.lookup(path)?)
    }

    /// Replaces the permission bits, keeping the type bits.
    pub fn chmod(&mut self, path: &str, mode: u32) -> FsResult<NodeAttr> {
        let ino = self.lookup(path)?;
        self.apply(
            ino,
            &AttrChanges {
                mode: Some(mode),
                ..AttrChanges::default()
            },
        )
    }

    /// Changes ownership. [`UNSET_ID`] leaves the corresponding id unchanged.
    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> FsResult<NodeAttr> {
        let ino = self.lookup(path)?;
        self.apply(
            ino,
            &AttrChanges {
                uid: (uid != UNSET_ID).then_some(uid),
                gid: (gid != UNSET_ID).then_some(gid),
                ..AttrChanges::default()
            },
        )
    }

    /// Sets access and modification times; `None` sets both to now.
    pub fn utimens(&mut self, path: &str, times: Option<[SystemTime; 2]>) -> FsResult<NodeAttr> {
        let ino = self.lookup(path)?;
        let [atime, mtime] = times.unwrap_or_else(|| {
            let now = SystemTime::now();
            [now, now]
        });
        self.apply(
            ino,
            &AttrChanges {
                atime: Some(atime),
                mtime: Some(mtime),
                ..AttrChanges::default()
            },
        )
    }

    pub fn chflags(&mut self, path: &str, flags: u32) -> FsResult<NodeAttr> {
        let ino = self.lookup(path)?;
        self.apply(
            ino,
            &AttrChanges {
                flags: Some(flags),
                ..AttrChanges::default()
            },
        )
    }

    pub fn setcrtime(&mut self, path: &str, time: SystemTime) -> FsResult<NodeAttr> {
        let ino = self.lookup(path)?;
        self.apply(
            ino,
            &AttrChanges {
                crtime: Some(time),
                ..AttrChanges::default()
            },
        )
    }

    pub fn setchgtime(&mut self, path: &str, time: SystemTime) -> FsResult<NodeAttr> {
        let ino = self.lookup(path)?;
        self.apply(
            ino,
            &AttrChanges {
                chgtime: Some(time),
                ..AttrChanges::default()
            },
        )
    }

    /// Commits a set of attribute changes to one node. The change time ends
    /// up at now unless `chgtime` sets it explicitly.
    pub fn apply(&mut self, ino: Ino, changes: &AttrChanges) -> FsResult<NodeAttr> {
        let node = self.node_mut(ino)?;
        let attr = &mut node.attr;
        if let Some(mode) = changes.mode {
            attr.mode = (attr.mode & S_IFMT) | (mode & PERM_MASK);
        }
        if let Some(uid) = changes.uid {
            attr.uid = uid;
        }
        if let Some(gid) = changes.gid {
            attr.gid = gid;
        }
        if let Some(atime) = changes.atime {
            attr.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            attr.mtime = mtime;
        }
        if let Some(crtime) = changes.crtime {
            attr.crtime = crtime;
        }
        if let Some(flags) = changes.flags {
            attr.flags = flags;
        }
        attr.ctime = changes.chgtime.unwrap_or_else(SystemTime::now);
        node.local_edits = true;
        Ok(node.attr)
    }

    /// Sets the cached size and touches modification/change time.
    pub(crate) fn set_size(&mut self, ino: Ino, size: u64) -> FsResult<NodeAttr> {
        let node = self.node_mut(ino)?;
        node.attr.size = size;
        node.touch_modified(SystemTime::now());
        Ok(node.attr)
    }

    // ---- extended attributes ----

    pub fn setxattr(
        &mut self,
        path: &str,
        name: &str,
        value: &[u8],
        mode: XattrMode,
    ) -> FsResult<()> {
        let ino = self.lookup(path)?;
        if name == RESERVED_XATTR {
            return Err(FsError::OperationNotSupported(name.to_string()));
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        let node = self.node_mut(ino)?;
        let present = node.xattrs.contains_key(name);
        match mode {
            XattrMode::Create if present => {
                return Err(FsError::AttributeExists(name.to_string()));
            }
            XattrMode::Replace if !present => {
                return Err(FsError::AttributeNotFound(name.to_string()));
            }
            _ => {}
        }
        node.xattrs.insert(name.to_string(), value.to_vec());
        node.attr.ctime = SystemTime::now();
        Ok(())
    }

    pub fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        let node = self.node(self.lookup(path)?)?;
        if name == RESERVED_XATTR {
            return Err(FsError::OperationNotSupported(name.to_string()));
        }
        node.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::AttributeNotFound(name.to_string()))
    }

    pub fn removexattr(&mut self, path: &str, name: &str) -> FsResult<()> {
        let ino = self.lookup(path)?;
        if name == RESERVED_XATTR {
            return Err(FsError::OperationNotSupported(name.to_string()));
        }
        let node = self.node_mut(ino)?;
        node.xattrs
            .remove(name)
            .ok_or_else(|| FsError::AttributeNotFound(name.to_string()))?;
        node.attr.ctime = SystemTime::now();
        Ok(())
    }

    /// Passes every attribute name to `fill`. Returning `false` from `fill`
    /// aborts with `OutOfRange`.
    pub fn listxattr(&self, path: &str, mut fill: impl FnMut(&str) -> bool) -> FsResult<()> {
        let node = self.node(self.lookup(path)?)?;
        for name in node.xattrs.keys() {
            if !fill(name) {
                return Err(FsError::OutOfRange);
            }
        }
        Ok(())
    }

    // ---- references ----

    /// Records one kernel lookup reference.
    pub fn remember(&mut self, ino: Ino) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.lookups += 1;
        }
    }

    /// Drops `n` kernel lookup references. Detached nodes go away once
    /// nothing refers to them.
    pub fn forget(&mut self, ino: Ino, n: u64) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.lookups = node.lookups.saturating_sub(n);
            self.collect(ino);
        }
    }

    pub(crate) fn open_ref(&mut self, ino: Ino) -> FsResult<u32> {
        let node = self.node_mut(ino)?;
        node.open_count += 1;
        Ok(node.open_count)
    }

    /// Drops one open reference. Returns the remaining count.
    pub(crate) fn close_ref(&mut self, ino: Ino) -> u32 {
        let Some(node) = self.nodes.get_mut(&ino) else {
            return 0;
        };
        node.open_count = node.open_count.saturating_sub(1);
        let remaining = node.open_count;
        if remaining == 0 {
            self.collect(ino);
        }
        remaining
    }

    // ---- remote discovery ----

    /// Inserts a node for a remote entry observed under `parent`.
    pub(crate) fn insert_discovered(&mut self, parent: Ino, entry: &RemoteEntry) -> Ino {
        let kind = kind_of(entry.kind);
        let perm = entry.perm.unwrap_or(if kind.is_dir() {
            self.config.default_dir_mode
        } else {
            self.config.default_file_mode
        });
        let now = SystemTime::now();
        let ino = self.allocate();
        let mut attr = NodeAttr::new(ino, kind, perm, self.owner.uid, self.owner.gid, now);
        attr.size = entry.size;
        if let Some(mtime) = entry.mtime {
            attr.mtime = mtime;
            attr.ctime = mtime;
            attr.atime = mtime;
            attr.crtime = mtime;
        }
        self.nodes.insert(ino, Node::new(attr));
        self.attach(parent, &entry.name, ino);
        ino
    }

    /// Updates a cached node from a remote entry of the same kind. Returns
    /// false if the kind differs (the caller must replace the node).
    pub(crate) fn refresh(&mut self, ino: Ino, entry: &RemoteEntry) -> bool {
        let Some(node) = self.nodes.get_mut(&ino) else {
            return false;
        };
        if node.kind() != kind_of(entry.kind) {
            return false;
        }
        node.seen = Instant::now();
        if !node.is_dir() {
            node.attr.size = entry.size;
        }
        if !node.local_edits {
            if let Some(perm) = entry.perm {
                node.attr.mode = (node.attr.mode & S_IFMT) | (perm & PERM_MASK);
            }
            if let Some(mtime) = entry.mtime {
                node.attr.mtime = mtime;
            }
        }
        true
    }

    /// Inserts, refreshes or replaces the child `entry.name` of `parent`.
    pub(crate) fn upsert(&mut self, parent: Ino, entry: &RemoteEntry) -> (Ino, UpsertOutcome) {
        if let Some(existing) = self.child(parent, &entry.name) {
            if self.refresh(existing, entry) {
                return (existing, UpsertOutcome::Updated);
            }
            self.prune(parent, &entry.name);
            return (self.insert_discovered(parent, entry), UpsertOutcome::Replaced);
        }
        (self.insert_discovered(parent, entry), UpsertOutcome::Inserted)
    }

    /// Orders a directory's children to match `order`; names not in `order`
    /// keep their relative order at the end.
    pub(crate) fn reorder(&mut self, parent: Ino, order: &[String]) {
        let Some(children) = self
            .nodes
            .get_mut(&parent)
            .and_then(|p| p.children.as_mut())
        else {
            return;
        };
        let rank: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let key = |name: &String| rank.get(name.as_str()).copied().unwrap_or(usize::MAX);
        children.sort_by(|a, _, b, _| key(a).cmp(&key(b)));
    }

    /// Marks a node as confirmed by the remote.
    pub(crate) fn mark_seen(&mut self, ino: Ino) {
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.seen = Instant::now();
        }
    }

    /// Returns true if the node was confirmed by the remote within `attr_ttl`.
    pub fn is_fresh(&self, ino: Ino) -> bool {
        self.nodes
            .get(&ino)
            .is_some_and(|n| n.seen.elapsed() < self.config.attr_ttl)
    }

    // ---- eviction ----

    /// Evicts least-recently-seen leaves until the arena is back under
    /// `max_nodes`. Only closed, kernel-unreferenced nodes without local-only
    /// state are candidates. Returns the number evicted.
    pub fn evict(&mut self) -> u64 {
        let excess = self.nodes.len().saturating_sub(self.config.max_nodes);
        if excess == 0 {
            return 0;
        }
        let mut candidates: Vec<(Instant, Ino)> = self
            .nodes
            .iter()
            .filter(|(ino, node)| {
                **ino != ROOT_INO
                    && node.links.len() == 1
                    && !node.is_referenced()
                    && !node.local_edits
                    && node.xattrs.is_empty()
                    && node.child_count() == 0
            })
            .map(|(ino, node)| (node.seen, *ino))
            .collect();
        candidates.sort_unstable();

        let mut evicted = 0;
        for (_, ino) in candidates.into_iter().take(excess) {
            let Some((parent, name)) = self.nodes.get(&ino).and_then(|n| n.links.first().cloned())
            else {
                continue;
            };
            evicted += self.prune(parent, &name);
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.listed = false;
            }
        }
        evicted
    }
}

/// Outcome of [`NodeCache::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpsertOutcome {
    Inserted,
    Updated,
    Replaced,
}

fn kind_of(kind: RemoteKind) -> NodeKind {
    match kind {
        RemoteKind::Directory => NodeKind::Directory,
        RemoteKind::File => NodeKind::File,
        RemoteKind::Symlink => NodeKind::Symlink,
    }
}

/// The type rule shared by remove and rename's replacement step.
fn check_replaceable(node: &Node, path: &str, expect_dir: bool) -> FsResult<()> {
    match (node.is_dir(), expect_dir) {
        (true, false) => Err(FsError::IsADirectory(path.to_string())),
        (false, true) => Err(FsError::NotADirectory(path.to_string())),
        (true, true) if node.child_count() > 0 => {
            Err(FsError::DirectoryNotEmpty(path.to_string()))
        }
        _ => Ok(()),
    }
}

fn prefix(parts: &[&str], n: usize) -> String {
    format!("/{}", parts[..n].join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> NodeCache {
        NodeCache::new(CacheConfig::default(), Caller::new(1000, 1000))
    }

    fn mkdir(c: &mut NodeCache, path: &str) -> Ino {
        c.create(path, NodeKind::Directory, 0o755, Caller::new(1, 2), None)
            .unwrap()
    }

    fn mkfile(c: &mut NodeCache, path: &str) -> Ino {
        c.create(path, NodeKind::File, 0o644, Caller::new(1, 2), None)
            .unwrap()
    }

    #[test]
    fn test_resolve_root() {
        let c = cache();
        let r = c.resolve("/", None).unwrap();
        assert_eq!(r.node, Some(ROOT_INO));
        assert_eq!(r.parent, None);
        assert_eq!(c.getattr("").unwrap().kind(), NodeKind::Directory);
    }

    #[test]
    fn test_create_then_resolve() {
        let mut c = cache();
        let d = mkdir(&mut c, "/a");
        let f = mkfile(&mut c, "/a/f");
        assert!(f > d && d > ROOT_INO);

        let attr = c.getattr("/a/f").unwrap();
        assert_eq!(attr.kind(), NodeKind::File);
        assert_eq!((attr.uid, attr.gid), (1, 2));
        assert_eq!(c.lookup("/a").unwrap(), d);
        assert_eq!(c.path_of(f).as_deref(), Some("/a/f"));
    }

    #[test]
    fn test_create_errors() {
        let mut c = cache();
        mkfile(&mut c, "/f");
        assert!(matches!(
            c.create("/f", NodeKind::File, 0o644, Caller::default(), None),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            c.create("/missing/f", NodeKind::File, 0o644, Caller::default(), None),
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            c.create("/f/x", NodeKind::File, 0o644, Caller::default(), None),
            Err(FsError::NotADirectory(_))
        ));
        let long = format!("/{}", "n".repeat(NAME_MAX + 1));
        assert!(matches!(
            c.create(&long, NodeKind::File, 0o644, Caller::default(), None),
            Err(FsError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_create_touches_parent() {
        let mut c = cache();
        let before = c.getattr("/").unwrap().mtime;
        std::thread::sleep(std::time::Duration::from_millis(5));
        mkfile(&mut c, "/f");
        assert!(c.getattr("/").unwrap().mtime > before);
    }

    #[test]
    fn test_symlink_payload_sets_size() {
        let mut c = cache();
        let ino = c
            .create(
                "/l",
                NodeKind::Symlink,
                0o777,
                Caller::default(),
                Some(b"target".to_vec()),
            )
            .unwrap();
        let node = c.get(ino).unwrap();
        assert_eq!(node.payload(), Some(&b"target"[..]));
        assert_eq!(node.attr().size, 6);
    }

    #[test]
    fn test_remove_type_rules() {
        let mut c = cache();
        mkdir(&mut c, "/d");
        mkfile(&mut c, "/d/f");
        mkfile(&mut c, "/d/g");

        assert!(matches!(c.remove("/d", false), Err(FsError::IsADirectory(_))));
        assert!(matches!(c.remove("/d/f", true), Err(FsError::NotADirectory(_))));
        assert!(matches!(c.remove("/d", true), Err(FsError::DirectoryNotEmpty(_))));
        c.remove("/d/f", false).unwrap();
        assert!(matches!(c.remove("/d", true), Err(FsError::DirectoryNotEmpty(_))));
        c.remove("/d/g", false).unwrap();
        c.remove("/d", true).unwrap();
        assert_eq!(c.resolve("/d", None).unwrap().node, None);
        assert!(matches!(c.remove("/d", true), Err(FsError::NotFound(_))));
        assert!(matches!(c.remove("/", true), Err(FsError::NotPermitted(_))));
    }

    #[test]
    fn test_rename_moves_identity() {
        let mut c = cache();
        mkdir(&mut c, "/a");
        mkdir(&mut c, "/b");
        let f = mkfile(&mut c, "/a/f");
        c.setxattr("/a/f", "user.k", b"v", XattrMode::Any).unwrap();

        c.rename("/a/f", "/b/g").unwrap();
        assert_eq!(c.lookup("/b/g").unwrap(), f);
        assert!(c.resolve("/a/f", None).unwrap().node.is_none());
        assert_eq!(c.getxattr("/b/g", "user.k").unwrap(), b"v");
        assert_eq!(c.path_of(f).as_deref(), Some("/b/g"));
    }

    #[test]
    fn test_rename_same_path_is_noop() {
        let mut c = cache();
        let d = mkdir(&mut c, "/a");
        let plan = c.rename("/a", "/a").unwrap();
        assert!(plan.noop);
        assert_eq!(c.lookup("/a").unwrap(), d);
    }

    #[test]
    fn test_rename_into_own_subtree_is_invalid() {
        let mut c = cache();
        mkdir(&mut c, "/a");
        mkdir(&mut c, "/a/b");
        assert!(matches!(
            c.rename("/a", "/a/b"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            c.rename("/a", "/a/b/c"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(c.rename("/a", "/a/x"), Err(FsError::InvalidArgument(_))));
        // tree unchanged
        assert!(c.lookup("/a/b").is_ok());
    }

    #[test]
    fn test_rename_replaces_compatible_target() {
        let mut c = cache();
        let src = mkfile(&mut c, "/src");
        let dst = mkfile(&mut c, "/dst");
        mkdir(&mut c, "/dir");
        mkdir(&mut c, "/full");
        mkfile(&mut c, "/full/x");

        assert!(matches!(c.rename("/src", "/dir"), Err(FsError::IsADirectory(_))));
        assert!(matches!(c.rename("/dir", "/dst"), Err(FsError::NotADirectory(_))));
        assert!(matches!(
            c.rename("/dir", "/full"),
            Err(FsError::DirectoryNotEmpty(_))
        ));

        let plan = c.rename("/src", "/dst").unwrap();
        assert_eq!(plan.replaced, Some((dst, false)));
        assert_eq!(c.lookup("/dst").unwrap(), src);
        assert!(c.get(dst).is_none());
    }

    #[test]
    fn test_rename_missing() {
        let mut c = cache();
        mkfile(&mut c, "/f");
        assert!(matches!(c.rename("/nope", "/x"), Err(FsError::NotFound(_))));
        assert!(matches!(c.rename("/f", "/no/x"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_hard_link_shares_node() {
        let mut c = cache();
        let f = mkfile(&mut c, "/f");
        mkdir(&mut c, "/d");
        assert_eq!(c.link("/f", "/d/g").unwrap(), f);
        assert_eq!(c.lookup("/d/g").unwrap(), f);
        assert_eq!(c.getattr("/f").unwrap().nlink, 2);

        assert!(matches!(c.link("/f", "/d/g"), Err(FsError::AlreadyExists(_))));
        assert!(matches!(c.link("/d", "/d2"), Err(FsError::NotPermitted(_))));

        c.remove("/f", false).unwrap();
        assert_eq!(c.getattr("/d/g").unwrap().nlink, 1);
        assert_eq!(c.path_of(f).as_deref(), Some("/d/g"));
    }

    #[test]
    fn test_chmod_preserves_type() {
        let mut c = cache();
        mkdir(&mut c, "/d");
        let attr = c.chmod("/d", 0o100_700).unwrap();
        assert_eq!(attr.kind(), NodeKind::Directory);
        assert_eq!(attr.perm(), 0o700);
    }

    #[test]
    fn test_chown_unset_sentinel() {
        let mut c = cache();
        mkfile(&mut c, "/f");
        let attr = c.chown("/f", 42, UNSET_ID).unwrap();
        assert_eq!((attr.uid, attr.gid), (42, 2));
        let attr = c.chown("/f", UNSET_ID, 7).unwrap();
        assert_eq!((attr.uid, attr.gid), (42, 7));
    }

    #[test]
    fn test_utimens_defaults_to_now_and_touches_ctime() {
        let mut c = cache();
        mkfile(&mut c, "/f");
        let past = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000);
        let attr = c.utimens("/f", Some([past, past])).unwrap();
        assert_eq!(attr.atime, past);
        assert_eq!(attr.mtime, past);
        assert!(attr.ctime > past);

        let attr = c.utimens("/f", None).unwrap();
        assert!(attr.atime > past);
        assert_eq!(attr.atime, attr.mtime);
    }

    #[test]
    fn test_flags_and_times() {
        let mut c = cache();
        mkfile(&mut c, "/f");
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(5);
        assert_eq!(c.chflags("/f", 0x8).unwrap().flags, 0x8);
        assert_eq!(c.setcrtime("/f", t).unwrap().crtime, t);
        assert_eq!(c.setchgtime("/f", t).unwrap().ctime, t);
        assert!(matches!(c.chflags("/nope", 0), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_xattr_modes() {
        let mut c = cache();
        mkfile(&mut c, "/f");
        c.setxattr("/f", "k", b"1", XattrMode::Create).unwrap();
        assert!(matches!(
            c.setxattr("/f", "k", b"2", XattrMode::Create),
            Err(FsError::AttributeExists(_))
        ));
        assert!(matches!(
            c.setxattr("/f", "other", b"2", XattrMode::Replace),
            Err(FsError::AttributeNotFound(_))
        ));
        c.setxattr("/f", "k", b"3", XattrMode::Replace).unwrap();
        assert_eq!(c.getxattr("/f", "k").unwrap(), b"3");
        assert!(matches!(
            c.setxattr("/f", RESERVED_XATTR, b"", XattrMode::Any),
            Err(FsError::OperationNotSupported(_))
        ));

        c.removexattr("/f", "k").unwrap();
        assert!(matches!(c.getxattr("/f", "k"), Err(FsError::AttributeNotFound(_))));
        assert!(matches!(c.removexattr("/f", "k"), Err(FsError::AttributeNotFound(_))));
    }

    #[test]
    fn test_listxattr_truncation() {
        let mut c = cache();
        mkfile(&mut c, "/f");
        c.setxattr("/f", "a", b"", XattrMode::Any).unwrap();
        c.setxattr("/f", "b", b"", XattrMode::Any).unwrap();

        let mut names = Vec::new();
        c.listxattr("/f", |n| {
            names.push(n.to_string());
            true
        })
        .unwrap();
        assert_eq!(names, vec!["a", "b"]);

        assert!(matches!(c.listxattr("/f", |_| false), Err(FsError::OutOfRange)));
    }

    #[test]
    fn test_removed_open_node_survives_until_closed() {
        let mut c = cache();
        let f = mkfile(&mut c, "/f");
        c.open_ref(f).unwrap();
        c.remove("/f", false).unwrap();
        assert!(c.get(f).is_some());
        assert_eq!(c.path_of(f), None);
        assert_eq!(c.close_ref(f), 0);
        assert!(c.get(f).is_none());
    }

    #[test]
    fn test_forget_collects_detached() {
        let mut c = cache();
        let f = mkfile(&mut c, "/f");
        c.remember(f);
        c.remember(f);
        c.remove("/f", false).unwrap();
        c.forget(f, 1);
        assert!(c.get(f).is_some());
        c.forget(f, 1);
        assert!(c.get(f).is_none());
    }

    #[test]
    fn test_prune_subtree() {
        let mut c = cache();
        let d = mkdir(&mut c, "/d");
        let e = mkdir(&mut c, "/d/e");
        let f = mkfile(&mut c, "/d/e/f");
        c.open_ref(f).unwrap();

        let dropped = c.prune(ROOT_INO, "d");
        assert_eq!(dropped, 2);
        assert!(c.get(d).is_none());
        assert!(c.get(e).is_none());
        // still open, kept as an orphan
        assert!(c.get(f).is_some());
        assert_eq!(c.path_of(f), None);
    }

    #[test]
    fn test_inodes_never_reused() {
        let mut c = cache();
        let a = mkfile(&mut c, "/a");
        c.remove("/a", false).unwrap();
        let b = mkfile(&mut c, "/a");
        assert!(b > a);
    }

    #[test]
    fn test_evict_respects_references() {
        let mut c = NodeCache::new(CacheConfig::default().max_nodes(3), Caller::default());
        let entries: Vec<Ino> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| c.insert_discovered(ROOT_INO, &RemoteEntry::file(*n, 1)))
            .collect();
        c.open_ref(entries[0]).unwrap();
        c.remember(entries[1]);
        // root + 4 files, bound 3: two must go, neither open nor looked up
        assert_eq!(c.evict(), 2);
        assert!(c.get(entries[0]).is_some());
        assert!(c.get(entries[1]).is_some());
        assert!(c.get(entries[2]).is_none());
        assert!(c.get(entries[3]).is_none());
        assert!(!c.get(ROOT_INO).unwrap().listed);
    }

    #[test]
    fn test_reorder_follows_listing() {
        let mut c = cache();
        for n in ["x", "y", "z"] {
            c.insert_discovered(ROOT_INO, &RemoteEntry::file(n, 0));
        }
        c.reorder(ROOT_INO, &["z".to_string(), "x".to_string(), "y".to_string()]);
        let names: Vec<_> = c.get(ROOT_INO).unwrap().child_names().collect();
        assert_eq!(names, vec!["z", "x", "y"]);
    }
}
