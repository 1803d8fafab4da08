//! Attribute, extended attribute and capacity tests.
//!
//! Run: `cargo nextest run -p sftpfs-core attr_tests`

mod common;

use common::*;
use sftpfs_core::node::UNSET_ID;
use sftpfs_core::{AttrChanges, FALLBACK_CAPACITY, FsError, RESERVED_XATTR, XattrMode};
use std::time::{Duration, SystemTime};

fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

// =============================================================================
// Attributes
// =============================================================================

#[tokio::test]
async fn test_chmod_keeps_type() {
    let f = Fixture::new();
    f.fs.mkdir("/d", 0o755, TEST_CALLER).await.unwrap();
    let attr = f.fs.chmod("/d", 0o100_700).await.unwrap();
    assert_eq!(attr.perm(), 0o700);
    assert!(attr.kind().is_dir());
}

#[tokio::test]
async fn test_chown_partial() {
    let f = Fixture::new();
    f.fs.mknod("/f", 0o644, TEST_CALLER).await.unwrap();
    let attr = f.fs.chown("/f", 42, UNSET_ID).await.unwrap();
    assert_eq!((attr.uid, attr.gid), (42, 1000));
    let attr = f.fs.chown("/f", UNSET_ID, 7).await.unwrap();
    assert_eq!((attr.uid, attr.gid), (42, 7));
}

#[tokio::test]
async fn test_utimens_explicit_and_now() {
    let f = Fixture::new();
    f.fs.mknod("/f", 0o644, TEST_CALLER).await.unwrap();
    let attr = f.fs.utimens("/f", Some([at(10), at(20)])).await.unwrap();
    assert_eq!(attr.atime, at(10));
    assert_eq!(attr.mtime, at(20));

    let attr = f.fs.utimens("/f", None).await.unwrap();
    assert!(attr.mtime > at(20));
    assert_eq!(attr.atime, attr.mtime);
}

#[tokio::test]
async fn test_birth_change_time_and_flags() {
    let f = Fixture::new();
    f.fs.mknod("/f", 0o644, TEST_CALLER).await.unwrap();
    assert_eq!(f.fs.setcrtime("/f", at(5)).await.unwrap().crtime, at(5));
    assert_eq!(f.fs.setchgtime("/f", at(6)).await.unwrap().ctime, at(6));
    assert_eq!(f.fs.chflags("/f", 0x8).await.unwrap().flags, 0x8);
}

#[tokio::test]
async fn test_setattr_single_commit() {
    let f = Fixture::new();
    f.write_file("/f", b"abcdef").await.unwrap();
    let attr = f
        .fs
        .setattr(
            "/f",
            Some(1),
            &AttrChanges {
                gid: Some(3),
                atime: Some(at(1)),
                chgtime: Some(at(2)),
                ..AttrChanges::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(attr.size, 1);
    assert_eq!(attr.gid, 3);
    assert_eq!(attr.atime, at(1));
    assert_eq!(attr.ctime, at(2));
    assert_eq!(f.store.contents("/f").unwrap(), b"a");
}

#[tokio::test]
async fn test_local_edits_survive_relisting() {
    let f = Fixture::uncached();
    f.store.put_file("/f", b"");
    f.names("/").await.unwrap();
    f.fs.chmod("/f", 0o640).await.unwrap();
    f.names("/").await.unwrap();
    assert_eq!(f.fs.getattr("/f").await.unwrap().perm(), 0o640);
}

#[tokio::test]
async fn test_attr_missing_path() {
    let f = Fixture::new();
    assert_not_found(f.fs.chmod("/none", 0o600).await);
    assert_not_found(f.fs.getattr("/none").await);
}

// =============================================================================
// Extended attributes
// =============================================================================

#[tokio::test]
async fn test_xattr_create_replace_semantics() {
    let f = Fixture::new();
    f.fs.mknod("/f", 0o644, TEST_CALLER).await.unwrap();

    f.fs.setxattr("/f", "user.k", b"v1", XattrMode::Create)
        .await
        .unwrap();
    assert_err!(
        f.fs.setxattr("/f", "user.k", b"v2", XattrMode::Create).await,
        FsError::AttributeExists(_)
    );
    assert_err!(
        f.fs.setxattr("/f", "user.other", b"v", XattrMode::Replace).await,
        FsError::AttributeNotFound(_)
    );
    f.fs.setxattr("/f", "user.k", b"v3", XattrMode::Replace)
        .await
        .unwrap();
    assert_eq!(f.fs.getxattr("/f", "user.k").await.unwrap(), b"v3");

    f.fs.removexattr("/f", "user.k").await.unwrap();
    assert_err!(
        f.fs.getxattr("/f", "user.k").await,
        FsError::AttributeNotFound(_)
    );
    assert_err!(
        f.fs.removexattr("/f", "user.k").await,
        FsError::AttributeNotFound(_)
    );
}

#[tokio::test]
async fn test_xattr_reserved_name() {
    let f = Fixture::new();
    f.fs.mknod("/f", 0o644, TEST_CALLER).await.unwrap();
    let err = f
        .fs
        .setxattr("/f", RESERVED_XATTR, b"", XattrMode::Any)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::ENOTSUP);
}

#[tokio::test]
async fn test_reserved_xattr_on_missing_path_is_not_found() {
    let f = Fixture::new();
    assert_not_found(
        f.fs.setxattr("/missing", RESERVED_XATTR, b"", XattrMode::Any)
            .await,
    );
    assert_not_found(f.fs.getxattr("/missing", RESERVED_XATTR).await);
    assert_not_found(f.fs.removexattr("/missing", RESERVED_XATTR).await);

    f.fs.mknod("/f", 0o644, TEST_CALLER).await.unwrap();
    assert_err!(
        f.fs.getxattr("/f", RESERVED_XATTR).await,
        FsError::OperationNotSupported(_)
    );
    assert_err!(
        f.fs.removexattr("/f", RESERVED_XATTR).await,
        FsError::OperationNotSupported(_)
    );
}

#[tokio::test]
async fn test_listxattr_buffer_exhaustion() {
    let f = Fixture::new();
    f.fs.mknod("/f", 0o644, TEST_CALLER).await.unwrap();
    for name in ["user.b", "user.a"] {
        f.fs.setxattr("/f", name, b"1", XattrMode::Any).await.unwrap();
    }

    let mut names = Vec::new();
    f.fs.listxattr("/f", |n| {
        names.push(n.to_string());
        true
    })
    .await
    .unwrap();
    assert_eq!(names, vec!["user.a", "user.b"]);

    let mut budget = 1;
    assert_err!(
        f.fs.listxattr("/f", |_| {
            budget -= 1;
            budget >= 0
        })
        .await,
        FsError::OutOfRange
    );
}

#[tokio::test]
async fn test_xattrs_follow_rename() {
    let f = Fixture::new();
    f.fs.mknod("/a", 0o644, TEST_CALLER).await.unwrap();
    f.fs.setxattr("/a", "user.tag", b"t", XattrMode::Any)
        .await
        .unwrap();
    f.fs.rename("/a", "/b").await.unwrap();
    assert_eq!(f.fs.getxattr("/b", "user.tag").await.unwrap(), b"t");
}

// =============================================================================
// Capacity
// =============================================================================

#[tokio::test]
async fn test_statfs_fallback() {
    let f = Fixture::new();
    let cap = f.fs.statfs("/").await.unwrap();
    assert_eq!(cap, FALLBACK_CAPACITY);
    assert_eq!(cap.block_size, 4096);
    assert_eq!(cap.name_max, 255);
    assert!(cap.blocks_available <= cap.blocks_free);
    assert!(cap.blocks_free <= cap.blocks);
    assert!(cap.files_free <= cap.files);
}
