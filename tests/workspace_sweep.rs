use apkpatch::job::JobId;
use apkpatch::workspace::{WorkspaceManager, WORKSPACE_PREFIX};

#[test]
fn sweep_removes_only_job_directories() {
    let root = tempfile::tempdir().unwrap();
    let stale = root.path().join(format!("{WORKSPACE_PREFIX}left-by-crash"));
    std::fs::create_dir_all(stale.join("tree/smali")).unwrap();
    std::fs::write(stale.join("input.apk"), b"PK").unwrap();

    let unrelated_dir = root.path().join("someone_elses_dir");
    std::fs::create_dir(&unrelated_dir).unwrap();
    let unrelated_file = root.path().join(format!("{WORKSPACE_PREFIX}not-a-dir.txt"));
    std::fs::write(&unrelated_file, b"keep").unwrap();

    let manager = WorkspaceManager::new(root.path());
    let lock = manager.lock().unwrap().expect("scratch root is free");
    assert_eq!(manager.sweep_stale(&lock).unwrap(), 1);
    assert!(!stale.exists());
    assert!(unrelated_dir.is_dir());
    assert!(unrelated_file.is_file());
}

#[test]
fn missing_root_is_created_by_the_lock() {
    let root = tempfile::tempdir().unwrap();
    let manager = WorkspaceManager::new(root.path().join("apkpatch"));
    assert!(manager.list_active().unwrap().is_empty());

    let lock = manager.lock().unwrap().expect("scratch root is free");
    assert!(lock.path().starts_with(root.path().join("apkpatch")));
    assert_eq!(manager.sweep_stale(&lock).unwrap(), 0);
    assert!(manager.list_active().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn second_instance_cannot_sweep_live_workspaces() {
    let root = tempfile::tempdir().unwrap();
    let running = WorkspaceManager::new(root.path());
    let held = running.lock().unwrap().expect("scratch root is free");
    let live = running.acquire(JobId::new()).unwrap();
    std::fs::create_dir_all(live.tree_dir().join("smali")).unwrap();

    let other = WorkspaceManager::new(root.path());
    assert!(other.lock().unwrap().is_none());
    assert!(live.tree_dir().join("smali").is_dir());

    drop(live);
    drop(held);
    let lock = other.lock().unwrap().expect("lock released with its holder");
    assert_eq!(other.sweep_stale(&lock).unwrap(), 0);
}

#[test]
fn workspaces_are_exclusive_and_removed_on_drop() {
    let root = tempfile::tempdir().unwrap();
    let manager = WorkspaceManager::new(root.path());

    let a = manager.acquire(JobId::new()).unwrap();
    let b = manager.acquire(JobId::new()).unwrap();
    assert_ne!(a.path(), b.path());
    assert!(a.path().starts_with(root.path()));
    assert_eq!(manager.list_active().unwrap().len(), 2);

    let a_path = a.path().to_path_buf();
    std::fs::write(a.input_apk(), b"bytes").unwrap();
    drop(a);
    assert!(!a_path.exists());

    manager.release(b).unwrap();
    assert!(manager.list_active().unwrap().is_empty());
}

#[test]
fn reusing_a_job_id_is_refused() {
    let root = tempfile::tempdir().unwrap();
    let manager = WorkspaceManager::new(root.path());
    let id = JobId::new();
    let _held = manager.acquire(id).unwrap();
    assert!(manager.acquire(id).is_err());
}
