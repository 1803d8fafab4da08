//! Directory reconciliation.
//!
//! Applies a fresh remote listing to a cached directory: unseen entries are
//! inserted, known ones refreshed (or replaced if their kind changed), cached
//! children the listing no longer reports are pruned with their subtrees, and
//! the children are reordered to follow the listing.
//!
//! Children confirmed after the listing was requested (created locally while
//! the listing was in flight) are not pruned, unless the listing itself
//! reported the same node under another name.

use crate::cache::{NodeCache, UpsertOutcome};
use crate::node::Ino;
use crate::path;
use crate::remote::RemoteEntry;
use std::collections::HashSet;
use std::time::Instant;
use tracing::debug;

/// Counts of what a reconciliation changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: u64,
    pub updated: u64,
    pub replaced: u64,
    pub pruned: u64,
}

/// Reconciles the children of `dir` against `listing`, which was requested
/// at `requested`.
pub fn reconcile(
    cache: &mut NodeCache,
    dir: Ino,
    listing: &[RemoteEntry],
    requested: Instant,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let mut order: Vec<String> = Vec::with_capacity(listing.len());
    let mut reported: HashSet<&str> = HashSet::with_capacity(listing.len());
    let mut confirmed: HashSet<Ino> = HashSet::with_capacity(listing.len());

    for entry in listing {
        if let Err(e) = path::check_name(&entry.name) {
            debug!(dir, name = %entry.name, error = %e, "Skipping unusable remote entry");
            continue;
        }
        if !reported.insert(entry.name.as_str()) {
            continue;
        }
        let (ino, outcome) = cache.upsert(dir, entry);
        confirmed.insert(ino);
        match outcome {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Replaced => report.replaced += 1,
        }
        order.push(entry.name.clone());
    }

    let stale: Vec<String> = cache
        .get(dir)
        .map(|node| {
            node.child_names()
                .filter(|name| !reported.contains(name))
                .filter(|name| {
                    // A node this listing reported under another name is not
                    // fresh on account of this one.
                    cache.child(dir, name).is_none_or(|ino| {
                        confirmed.contains(&ino)
                            || cache.get(ino).is_none_or(|child| child.seen <= requested)
                    })
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for name in &stale {
        report.pruned += cache.prune(dir, name);
    }

    cache.reorder(dir, &order);
    if let Some(node) = cache.get_mut(dir) {
        node.listed = true;
    }
    cache.mark_seen(dir);

    if report != ReconcileReport::default() {
        debug!(
            dir,
            inserted = report.inserted,
            updated = report.updated,
            replaced = report.replaced,
            pruned = report.pruned,
            "Reconciled directory"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Caller;
    use crate::config::CacheConfig;
    use crate::node::{NodeKind, ROOT_INO};
    use crate::remote::RemoteKind;

    fn cache() -> NodeCache {
        NodeCache::new(CacheConfig::default(), Caller::default())
    }

    fn names(cache: &NodeCache, dir: Ino) -> Vec<String> {
        cache
            .get(dir)
            .unwrap()
            .child_names()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_inserts_in_listing_order() {
        let mut c = cache();
        let listing = vec![
            RemoteEntry::file("b", 3),
            RemoteEntry::dir("a"),
            RemoteEntry::file("c", 0),
        ];
        let report = reconcile(&mut c, ROOT_INO, &listing, Instant::now());
        assert_eq!(report.inserted, 3);
        assert_eq!(names(&c, ROOT_INO), vec!["b", "a", "c"]);
        assert_eq!(c.getattr("/b").unwrap().size, 3);
        assert_eq!(c.getattr("/a").unwrap().kind(), NodeKind::Directory);
        assert_eq!(c.getattr("/c").unwrap().perm(), 0o777);
        assert!(c.get(ROOT_INO).unwrap().listed);
    }

    #[test]
    fn test_pruned_hard_link_drops_link_count() {
        let mut c = cache();
        reconcile(&mut c, ROOT_INO, &[RemoteEntry::file("f", 1)], Instant::now());
        let f = c.lookup("/f").unwrap();
        assert_eq!(c.link("/f", "/g").unwrap(), f);
        assert_eq!(c.getattr("/f").unwrap().nlink, 2);

        let report = reconcile(&mut c, ROOT_INO, &[RemoteEntry::file("f", 1)], Instant::now());
        assert_eq!(report.pruned, 0);
        assert!(c.lookup("/g").is_err());
        assert_eq!(c.lookup("/f").unwrap(), f);
        assert_eq!(c.getattr("/f").unwrap().nlink, 1);
    }

    #[test]
    fn test_prunes_missing_subtree() {
        let mut c = cache();
        let start = Instant::now();
        reconcile(
            &mut c,
            ROOT_INO,
            &[RemoteEntry::dir("d"), RemoteEntry::file("f", 1)],
            start,
        );
        let d = c.lookup("/d").unwrap();
        reconcile(&mut c, d, &[RemoteEntry::file("inner", 1)], Instant::now());
        let inner = c.lookup("/d/inner").unwrap();

        let report = reconcile(&mut c, ROOT_INO, &[RemoteEntry::file("f", 1)], Instant::now());
        assert_eq!(report.pruned, 2);
        assert!(c.resolve("/d", None).unwrap().node.is_none());
        assert!(c.get(inner).is_none());
    }

    #[test]
    fn test_refreshes_size_and_replaces_kind() {
        let mut c = cache();
        reconcile(
            &mut c,
            ROOT_INO,
            &[RemoteEntry::file("x", 1), RemoteEntry::file("y", 1)],
            Instant::now(),
        );
        let x = c.lookup("/x").unwrap();
        let y = c.lookup("/y").unwrap();

        let report = reconcile(
            &mut c,
            ROOT_INO,
            &[RemoteEntry::file("x", 10), RemoteEntry::dir("y")],
            Instant::now(),
        );
        assert_eq!(report.updated, 1);
        assert_eq!(report.replaced, 1);
        assert_eq!(c.lookup("/x").unwrap(), x);
        assert_eq!(c.getattr("/x").unwrap().size, 10);
        assert_ne!(c.lookup("/y").unwrap(), y);
        assert_eq!(c.getattr("/y").unwrap().kind(), NodeKind::Directory);
    }

    #[test]
    fn test_keeps_children_created_during_listing() {
        let mut c = cache();
        let requested = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        c.create("/new", NodeKind::File, 0o644, Caller::default(), None)
            .unwrap();
        let report = reconcile(&mut c, ROOT_INO, &[], requested);
        assert_eq!(report.pruned, 0);
        assert!(c.lookup("/new").is_ok());
    }

    #[test]
    fn test_skips_unusable_and_duplicate_names() {
        let mut c = cache();
        let listing = vec![
            RemoteEntry::dir("."),
            RemoteEntry::dir(".."),
            RemoteEntry::file("ok", 1),
            RemoteEntry {
                name: "ok".into(),
                kind: RemoteKind::Directory,
                size: 0,
                perm: None,
                mtime: None,
            },
            RemoteEntry::file("n".repeat(300), 1),
        ];
        let report = reconcile(&mut c, ROOT_INO, &listing, Instant::now());
        assert_eq!(report.inserted, 1);
        assert_eq!(names(&c, ROOT_INO), vec!["ok"]);
        assert_eq!(c.getattr("/ok").unwrap().kind(), NodeKind::File);
    }
}
