//! Dispatcher tests over a real local directory.
//!
//! Run: `cargo nextest run -p sftpfs-core local_store_tests`

#![cfg(unix)]

mod common;

use common::*;
use sftpfs_core::{FsError, OpenMode};
use std::fs;

#[tokio::test]
async fn test_write_lands_on_disk() {
    let f = LocalFixture::new();
    f.fs.mkdir("/docs", 0o755, TEST_CALLER).await.unwrap();
    f.fs.mknod("/docs/a.txt", 0o644, TEST_CALLER).await.unwrap();
    let h = f.fs.open("/docs/a.txt", OpenMode::ReadWrite).await.unwrap();
    f.fs.write(h, 0, b"on disk").await.unwrap();
    f.fs.release(h).await.unwrap();

    let content = fs::read(f.dir.path().join("docs/a.txt")).unwrap();
    assert_eq!(content, b"on disk");
}

#[tokio::test]
async fn test_reads_existing_tree() {
    let f = LocalFixture::new();
    fs::create_dir(f.dir.path().join("sub")).unwrap();
    fs::write(f.dir.path().join("sub/data.bin"), b"0123456789").unwrap();

    assert_eq!(f.fs.getattr("/sub/data.bin").await.unwrap().size, 10);
    let h = f.fs.open("/sub/data.bin", OpenMode::Read).await.unwrap();
    assert_eq!(f.fs.read(h, 4, 3).await.unwrap(), b"456");
    f.fs.release(h).await.unwrap();

    let names: Vec<_> = f
        .fs
        .list_dir("/sub")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["data.bin"]);
}

#[tokio::test]
async fn test_rename_and_remove_on_disk() {
    let f = LocalFixture::new();
    fs::write(f.dir.path().join("old"), b"x").unwrap();
    fs::write(f.dir.path().join("target"), b"yy").unwrap();

    f.fs.rename("/old", "/target").await.unwrap();
    assert!(!f.dir.path().join("old").exists());
    assert_eq!(fs::read(f.dir.path().join("target")).unwrap(), b"x");

    f.fs.unlink("/target").await.unwrap();
    assert!(!f.dir.path().join("target").exists());
}

#[tokio::test]
async fn test_rmdir_refuses_unlisted_children() {
    let f = LocalFixture::new();
    fs::create_dir_all(f.dir.path().join("full/inner")).unwrap();
    assert_err!(f.fs.rmdir("/full").await, FsError::DirectoryNotEmpty(_));
    assert!(f.dir.path().join("full/inner").exists());
}

#[tokio::test]
async fn test_symlink_and_hard_link() {
    let f = LocalFixture::new();
    fs::write(f.dir.path().join("file"), b"abc").unwrap();

    f.fs.symlink("file", "/sym", TEST_CALLER).await.unwrap();
    assert_eq!(
        fs::read_link(f.dir.path().join("sym")).unwrap().to_str(),
        Some("file")
    );

    let attr = f.fs.link("/file", "/hard").await.unwrap();
    assert_eq!(attr.nlink, 2);
    assert_eq!(fs::read(f.dir.path().join("hard")).unwrap(), b"abc");
    assert_eq!(f.fs.getattr("/hard").await.unwrap().ino, attr.ino);
}

#[tokio::test]
async fn test_truncate_on_disk() {
    let f = LocalFixture::new();
    fs::write(f.dir.path().join("t"), b"abcdef").unwrap();
    f.fs.truncate("/t", 2).await.unwrap();
    assert_eq!(fs::read(f.dir.path().join("t")).unwrap(), b"ab");
}

#[tokio::test]
async fn test_statfs_is_consistent() {
    let f = LocalFixture::new();
    let cap = f.fs.statfs("/").await.unwrap();
    assert!(cap.block_size > 0);
    assert!(cap.blocks_available <= cap.blocks_free);
}
