//! Cached filesystem nodes.
//!
//! A [`Node`] mirrors one remote entry: its attributes, its in-memory
//! extended attributes, its open-handle count, and (for directories) the
//! child-name → inode mapping in remote listing order. Nodes live in the
//! [`NodeCache`](crate::cache::NodeCache) arena and refer to each other only
//! by inode number.

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime};

/// Inode number. Unique for the process lifetime, never reused.
pub type Ino = u64;

/// The root inode number (FUSE convention).
pub const ROOT_INO: Ino = 1;

/// File type mask.
pub const S_IFMT: u32 = 0o170_000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link type bits.
pub const S_IFLNK: u32 = 0o120_000;
/// Permission bits mask (including setuid/setgid/sticky).
pub const PERM_MASK: u32 = 0o7777;

/// Sentinel meaning "leave unchanged" for ownership updates.
pub const UNSET_ID: u32 = u32::MAX;

/// The kind of a node. Fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
}

impl NodeKind {
    /// Type bits for this kind.
    pub fn type_bits(self) -> u32 {
        match self {
            NodeKind::Directory => S_IFDIR,
            NodeKind::File => S_IFREG,
            NodeKind::Symlink => S_IFLNK,
        }
    }

    /// Derives the kind from a full mode word. Returns `None` for device
    /// nodes, FIFOs and sockets, which have no remote counterpart.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(NodeKind::Directory),
            S_IFREG | 0 => Some(NodeKind::File),
            S_IFLNK => Some(NodeKind::Symlink),
            _ => None,
        }
    }

    pub fn is_dir(self) -> bool {
        self == NodeKind::Directory
    }
}

/// Attributes of a cached node (the `stat` view).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: Ino,
    /// Type and permission bits.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Declared size. Advisory for regular files until refreshed remotely.
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub flags: u32,
}

impl NodeAttr {
    /// Builds attributes for a freshly created node with all four
    /// timestamps set to `now`.
    pub fn new(ino: Ino, kind: NodeKind, perm: u32, uid: u32, gid: u32, now: SystemTime) -> Self {
        Self {
            ino,
            mode: kind.type_bits() | (perm & PERM_MASK),
            nlink: 1,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            flags: 0,
        }
    }

    pub fn kind(&self) -> NodeKind {
        // mode bits are only ever written through NodeKind::type_bits
        NodeKind::from_mode(self.mode).unwrap_or(NodeKind::File)
    }

    /// Permission bits without the type.
    pub fn perm(&self) -> u32 {
        self.mode & PERM_MASK
    }
}

/// A cached filesystem entry.
#[derive(Debug)]
pub struct Node {
    pub(crate) attr: NodeAttr,
    /// Child name → inode, in remote listing order. `Some` only for directories.
    pub(crate) children: Option<IndexMap<String, Ino>>,
    /// Every (parent, name) link currently naming this node. Directories have
    /// at most one; the root and detached nodes have none.
    pub(crate) links: Vec<(Ino, String)>,
    /// In-memory extended attributes (never pushed to the remote).
    pub(crate) xattrs: BTreeMap<String, Vec<u8>>,
    /// Number of active opens through the handle table.
    pub(crate) open_count: u32,
    /// Kernel lookup references (see `remember`/`forget`).
    pub(crate) lookups: u64,
    /// Symlink target, or initial content handed to `create`.
    pub(crate) payload: Option<Vec<u8>>,
    /// Set once attributes are edited locally; such nodes are never evicted.
    pub(crate) local_edits: bool,
    /// Last time the remote confirmed this entry (listing, stat or creation).
    pub(crate) seen: Instant,
    /// For directories: whether `children` reflects a complete listing.
    pub(crate) listed: bool,
}

impl Node {
    pub(crate) fn new(attr: NodeAttr) -> Self {
        let children = attr.kind().is_dir().then(IndexMap::new);
        Self {
            attr,
            children,
            links: Vec::new(),
            xattrs: BTreeMap::new(),
            open_count: 0,
            lookups: 0,
            payload: None,
            local_edits: false,
            seen: Instant::now(),
            listed: false,
        }
    }

    pub fn attr(&self) -> &NodeAttr {
        &self.attr
    }

    pub fn kind(&self) -> NodeKind {
        self.attr.kind()
    }

    pub fn is_dir(&self) -> bool {
        self.kind().is_dir()
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Number of cached children (0 for non-directories).
    pub fn child_count(&self) -> usize {
        self.children.as_ref().map_or(0, IndexMap::len)
    }

    /// Child names in listing order.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children
            .iter()
            .flat_map(|c| c.keys().map(String::as_str))
    }

    pub(crate) fn child(&self, name: &str) -> Option<Ino> {
        self.children.as_ref()?.get(name).copied()
    }

    /// True while something outside the tree still refers to the node.
    pub(crate) fn is_referenced(&self) -> bool {
        self.open_count > 0 || self.lookups > 0
    }

    /// Touches modification and change time.
    pub(crate) fn touch_modified(&mut self, now: SystemTime) {
        self.attr.mtime = now;
        self.attr.ctime = now;
    }
}
