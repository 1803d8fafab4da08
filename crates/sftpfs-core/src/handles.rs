//! Handle table for open files and directories.
//!
//! A handle is the inode number of the opened node: the first opener creates
//! the entry and later openers of the same node share it, bumping a reference
//! count. File entries carry the remote stream once it has been opened.
//! Directory entries carry the listing snapshot used to resume enumeration at
//! a non-zero offset.
//!
//! Streams are handed out as `Arc` clones so the dispatcher can perform
//! network I/O without holding the table.

use crate::error::{FsError, FsResult};
use crate::node::{Ino, NodeKind};
use crate::remote::{OpenMode, RemoteFile};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque handle returned by `open`/`opendir`.
pub type Handle = u64;

/// What a handle was opened as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

/// One entry in the [`HandleTable`].
pub struct HandleEntry {
    ino: Ino,
    kind: HandleKind,
    refs: u32,
    stream: Option<(Arc<dyn RemoteFile>, OpenMode)>,
    listing: Vec<(String, Ino, NodeKind)>,
}

impl std::fmt::Debug for HandleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleEntry")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .field("refs", &self.refs)
            .field("stream", &self.stream.as_ref().map(|(_, mode)| mode))
            .field("listing", &self.listing.len())
            .finish()
    }
}

impl HandleEntry {
    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    /// Takes the remote stream out of the entry, for closing.
    pub(crate) fn take_stream(&mut self) -> Option<Arc<dyn RemoteFile>> {
        self.stream.take().map(|(s, _)| s)
    }
}

/// Table of open handles.
#[derive(Debug, Default)]
pub struct HandleTable {
    entries: HashMap<Handle, HandleEntry>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `ino`. Returns the handle and whether this call created the
    /// entry. Fails if the node is already open as the other kind.
    pub fn acquire(&mut self, ino: Ino, kind: HandleKind) -> FsResult<(Handle, bool)> {
        match self.entries.get_mut(&ino) {
            Some(entry) if entry.kind != kind => Err(match entry.kind {
                HandleKind::Directory => FsError::IsADirectory(format!("inode {ino}")),
                HandleKind::File => FsError::NotADirectory(format!("inode {ino}")),
            }),
            Some(entry) => {
                entry.refs += 1;
                Ok((ino, false))
            }
            None => {
                self.entries.insert(
                    ino,
                    HandleEntry {
                        ino,
                        kind,
                        refs: 1,
                        stream: None,
                        listing: Vec::new(),
                    },
                );
                Ok((ino, true))
            }
        }
    }

    pub fn get(&self, handle: Handle) -> FsResult<&HandleEntry> {
        self.entries
            .get(&handle)
            .ok_or(FsError::InvalidHandle(handle))
    }

    fn get_mut(&mut self, handle: Handle) -> FsResult<&mut HandleEntry> {
        self.entries
            .get_mut(&handle)
            .ok_or(FsError::InvalidHandle(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The stream attached to a file handle, if any.
    pub fn stream(&self, handle: Handle) -> FsResult<Option<(Arc<dyn RemoteFile>, OpenMode)>> {
        let entry = self.get(handle)?;
        if entry.kind != HandleKind::File {
            return Err(FsError::IsADirectory(format!("inode {}", entry.ino)));
        }
        Ok(entry.stream.as_ref().map(|(s, m)| (Arc::clone(s), *m)))
    }

    /// Attaches a freshly opened stream. Whichever stream loses (the new one
    /// if an equally capable stream is already attached, otherwise the old
    /// one) is returned so the caller can close it outside the lock.
    pub fn install_stream(
        &mut self,
        handle: Handle,
        stream: Arc<dyn RemoteFile>,
        mode: OpenMode,
    ) -> Option<Arc<dyn RemoteFile>> {
        let Ok(entry) = self.get_mut(handle) else {
            return Some(stream);
        };
        match entry.stream.take() {
            Some((existing, existing_mode)) if existing_mode >= mode => {
                entry.stream = Some((existing, existing_mode));
                Some(stream)
            }
            previous => {
                entry.stream = Some((stream, mode));
                previous.map(|(s, _)| s)
            }
        }
    }

    /// Drops one reference. At zero the entry is removed and returned.
    pub fn release(&mut self, handle: Handle) -> FsResult<Option<HandleEntry>> {
        let entry = self.get_mut(handle)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(None);
        }
        Ok(self.entries.remove(&handle))
    }

    /// Removes every entry, regardless of reference counts.
    pub fn drain(&mut self) -> Vec<HandleEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    /// Replaces a directory handle's listing snapshot.
    pub fn set_listing(
        &mut self,
        handle: Handle,
        listing: Vec<(String, Ino, NodeKind)>,
    ) -> FsResult<()> {
        self.get_mut(handle)?.listing = listing;
        Ok(())
    }

    pub fn listing(&self, handle: Handle) -> FsResult<&[(String, Ino, NodeKind)]> {
        Ok(&self.get(handle)?.listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteResult;
    use async_trait::async_trait;

    struct NullFile;

    #[async_trait]
    impl RemoteFile for NullFile {
        async fn read_at(&self, _offset: u64, _len: usize) -> RemoteResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn write_at(&self, _offset: u64, data: &[u8]) -> RemoteResult<usize> {
            Ok(data.len())
        }

        async fn close(&self) -> RemoteResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_shared_handle_refcount() {
        let mut table = HandleTable::new();
        let (h1, first) = table.acquire(7, HandleKind::File).unwrap();
        assert!(first);
        let (h2, first) = table.acquire(7, HandleKind::File).unwrap();
        assert!(!first);
        assert_eq!(h1, h2);
        assert_eq!(table.get(h1).unwrap().refs(), 2);

        assert!(table.release(h1).unwrap().is_none());
        assert!(table.contains(h1));
        let last = table.release(h1).unwrap().unwrap();
        assert_eq!(last.ino(), 7);
        assert!(!table.contains(h1));
        assert!(matches!(table.release(h1), Err(FsError::InvalidHandle(7))));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut table = HandleTable::new();
        table.acquire(3, HandleKind::Directory).unwrap();
        assert!(matches!(
            table.acquire(3, HandleKind::File),
            Err(FsError::IsADirectory(_))
        ));
        assert!(matches!(table.stream(3), Err(FsError::IsADirectory(_))));
    }

    #[test]
    fn test_install_stream_keeps_most_capable() {
        let mut table = HandleTable::new();
        let (h, _) = table.acquire(5, HandleKind::File).unwrap();

        assert!(table.install_stream(h, Arc::new(NullFile), OpenMode::Read).is_none());
        // an upgrade displaces the read-only stream
        assert!(
            table
                .install_stream(h, Arc::new(NullFile), OpenMode::ReadWrite)
                .is_some()
        );
        // a read-only stream loses to the read-write one
        assert!(table.install_stream(h, Arc::new(NullFile), OpenMode::Read).is_some());
        let (_, mode) = table.stream(h).unwrap().unwrap();
        assert_eq!(mode, OpenMode::ReadWrite);
    }

    #[test]
    fn test_install_on_released_handle_returns_stream() {
        let mut table = HandleTable::new();
        assert!(table.install_stream(9, Arc::new(NullFile), OpenMode::Read).is_some());
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = HandleTable::new();
        table.acquire(2, HandleKind::File).unwrap();
        table.acquire(2, HandleKind::File).unwrap();
        table.acquire(4, HandleKind::Directory).unwrap();
        let mut drained: Vec<Ino> = table.drain().iter().map(HandleEntry::ino).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![2, 4]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_listing_snapshot() {
        let mut table = HandleTable::new();
        let (h, _) = table.acquire(1, HandleKind::Directory).unwrap();
        table
            .set_listing(
                h,
                vec![
                    ("a".into(), 2, NodeKind::File),
                    ("b".into(), 3, NodeKind::Directory),
                ],
            )
            .unwrap();
        assert_eq!(table.listing(h).unwrap().len(), 2);
    }
}
