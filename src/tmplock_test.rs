#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;

#[test]
fn test_acquire_writes_holder_identity() {
    let root = tempfile::tempdir().unwrap();

    let lock = TmpDirLock::acquire(root.path(), "dhctl destroy").unwrap();

    let content = std::fs::read_to_string(lock.path()).unwrap();
    assert!(content.ends_with(" $ dhctl destroy"));
    assert!(content.contains('@'));
}

#[test]
fn test_second_acquire_same_dir_fails_with_holder() {
    let root = tempfile::tempdir().unwrap();
    let _lock = TmpDirLock::acquire(root.path(), "dhctl destroy").unwrap();

    let err = TmpDirLock::acquire(root.path(), "dhctl converge").unwrap_err();

    match &err {
        TmpLockError::Held { holder, .. } => assert!(holder.contains("dhctl destroy")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("different --tmp-dir"));
}

#[test]
fn test_lock_in_ancestor_blocks_nested_dir() {
    let root = tempfile::tempdir().unwrap();
    let _lock = TmpDirLock::acquire(root.path(), "dhctl destroy").unwrap();
    let nested = root.path().join("a").join("b");

    let err = TmpDirLock::acquire(&nested, "dhctl destroy").unwrap_err();

    assert!(matches!(err, TmpLockError::Held { .. }));
}

#[test]
fn test_lock_in_descendant_blocks_parent_dir() {
    let root = tempfile::tempdir().unwrap();
    let nested = root.path().join("child");
    let _lock = TmpDirLock::acquire(&nested, "dhctl destroy").unwrap();

    let err = TmpDirLock::acquire(root.path(), "dhctl destroy").unwrap_err();

    match err {
        TmpLockError::Held { path, .. } => assert!(path.starts_with(root.path().canonicalize().unwrap())),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_drop_releases_lock() {
    let root = tempfile::tempdir().unwrap();
    {
        let _lock = TmpDirLock::acquire(root.path(), "dhctl destroy").unwrap();
    }

    assert!(!root.path().join(LOCK_FILE_NAME).exists());
    TmpDirLock::acquire(root.path(), "dhctl destroy").unwrap();
}

/// Test release tolerates the file already being gone
#[test]
fn test_release_tolerates_concurrent_removal() {
    let root = tempfile::tempdir().unwrap();
    let lock = TmpDirLock::acquire(root.path(), "dhctl destroy").unwrap();
    std::fs::remove_file(lock.path()).unwrap();

    lock.release();

    assert!(!root.path().join(LOCK_FILE_NAME).exists());
}
