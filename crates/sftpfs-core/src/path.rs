//! Helpers for the absolute, `/`-separated paths used by the dispatcher and
//! the remote store.
//!
//! Paths are plain strings: the root is `/`, empty components (from `//`) are
//! ignored, and no component is ever `.` or `..` once it reaches the cache.

use crate::error::{FsError, FsResult};

/// Maximum length in bytes of a single path component.
pub const NAME_MAX: usize = 255;

/// Iterates the non-empty components of a path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Validates one component: non-empty, no separator, at most [`NAME_MAX`] bytes.
pub fn check_name(name: &str) -> FsResult<()> {
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong(name.to_string()));
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument(format!("invalid name {name:?}")));
    }
    Ok(())
}

/// Joins a directory path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Normalizes a path to its canonical `/a/b` form (root stays `/`).
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for c in components(path) {
        out.push('/');
        out.push_str(c);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Returns true for the root path in any of its spellings (`""`, `/`, `//`).
pub fn is_root(path: &str) -> bool {
    components(path).next().is_none()
}

/// Splits a path into its parent directory and final component.
///
/// Returns `None` for the root.
pub fn split_last(path: &str) -> Option<(String, &str)> {
    let mut parts: Vec<&str> = components(path).collect();
    let name = parts.pop()?;
    let mut parent = String::from("/");
    parent.push_str(&parts.join("/"));
    Some((parent, name))
}
