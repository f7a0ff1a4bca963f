//! Eviction worker tests: the three cleanup passes against a real cache
//! directory and an in-memory store.

use spoolfs::cleaner::Cleaner;
use spoolfs::store::Store;
use spoolfs::types::{Entry, ROOT_PARENT_ID, State, StatRow};

use std::fs;
use std::path::Path;
use std::sync::Arc;

const DIR_MODE: u32 = 0o040_755;
const FILE_MODE: u32 = 0o100_644;

fn entry(id: i64, path: &str, name: &str, mode: u32, size: u64) -> Entry {
    Entry {
        id,
        parent_id: if id == 0 { ROOT_PARENT_ID } else { 0 },
        path: path.to_string(),
        name: name.to_string(),
        state: State::NoCached,
        last_access_ts: None,
        duration: None,
        stat: StatRow {
            mode,
            ino: id as u64,
            dev: 1,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size,
            atime: 0,
            ctime: 0,
            mtime: 0,
        },
    }
}

/// Ten cached 1000-byte files with strictly increasing last access, backed
/// by real files in the cache dir.
fn seeded(cache_dir: &Path) -> Arc<Store> {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let mut entries = vec![entry(0, "/", "media", DIR_MODE, 0)];
    for i in 1..=10 {
        let name = format!("f{i:02}.mkv");
        let mut e = entry(i, &format!("/{name}"), &name, FILE_MODE, 1000);
        e.state = State::Cached;
        e.last_access_ts = Some(100 + i);
        entries.push(e);
    }
    store.replace_entries(&entries).unwrap();
    for i in 1..=10 {
        fs::write(cache_dir.join(i.to_string()), vec![0_u8; 1000]).unwrap();
    }
    store
}

fn state_of(store: &Store, id: i64) -> State {
    store.get_state_size(id).unwrap().unwrap().0
}

#[test]
fn test_cleanup_evicts_oldest_until_target() {
    let tmp = tempfile::tempdir().unwrap();
    let store = seeded(tmp.path());
    let cleaner = Cleaner::new(tmp.path().to_path_buf(), Arc::clone(&store), 5_000);

    let used = cleaner.cleanup(3_000).unwrap();
    assert_eq!(used, 3_000);
    assert_eq!(store.get_cached_bytes().unwrap(), 3_000);

    // The seven oldest rows were flipped and their files removed.
    for id in 1..=7 {
        assert_eq!(state_of(&store, id), State::NoCached);
        assert!(!tmp.path().join(id.to_string()).exists());
    }
    for id in 8..=10 {
        assert_eq!(state_of(&store, id), State::Cached);
        assert!(tmp.path().join(id.to_string()).exists());
    }
}

#[test]
fn test_cleanup_under_target_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let store = seeded(tmp.path());
    let cleaner = Cleaner::new(tmp.path().to_path_buf(), Arc::clone(&store), 100_000);

    let used = cleaner.cleanup(60_000).unwrap();
    assert_eq!(used, 10_000);
    for id in 1..=10 {
        assert_eq!(state_of(&store, id), State::Cached);
        assert!(tmp.path().join(id.to_string()).exists());
    }
}

#[test]
fn test_cleanup_unmarks_rows_without_files() {
    let tmp = tempfile::tempdir().unwrap();
    let store = seeded(tmp.path());
    fs::remove_file(tmp.path().join("5")).unwrap();

    let cleaner = Cleaner::new(tmp.path().to_path_buf(), Arc::clone(&store), 100_000);
    let used = cleaner.cleanup(60_000).unwrap();

    // The row lost its file, so it no longer counts as cached.
    assert_eq!(state_of(&store, 5), State::NoCached);
    assert_eq!(used, 9_000);
}

#[test]
fn test_cleanup_removes_stray_files() {
    let tmp = tempfile::tempdir().unwrap();
    let store = seeded(tmp.path());

    // Not an id, an unknown id, and an un-cached row's leftover.
    fs::write(tmp.path().join("junk"), b"x").unwrap();
    fs::write(tmp.path().join("99"), b"x").unwrap();
    store.set_state(3, State::Cached, State::NoCached).unwrap();

    let cleaner = Cleaner::new(tmp.path().to_path_buf(), Arc::clone(&store), 100_000);
    cleaner.cleanup(60_000).unwrap();

    assert!(!tmp.path().join("junk").exists());
    assert!(!tmp.path().join("99").exists());
    assert!(!tmp.path().join("3").exists());
    assert!(tmp.path().join("4").exists());
}

#[test]
fn test_cleanup_removes_size_mismatch_and_unmarks_row() {
    let tmp = tempfile::tempdir().unwrap();
    let store = seeded(tmp.path());
    // Stored size says 1000; truncate the file behind the store's back.
    fs::write(tmp.path().join("7"), vec![0_u8; 400]).unwrap();

    let cleaner = Cleaner::new(tmp.path().to_path_buf(), Arc::clone(&store), 100_000);
    cleaner.cleanup(60_000).unwrap();

    assert!(!tmp.path().join("7").exists());
    assert_eq!(state_of(&store, 7), State::NoCached);
}

#[test]
fn test_cleanup_keeps_files_mid_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let store = seeded(tmp.path());
    // A file being copied right now: row says Caching, file pre-extended.
    let mut e = entry(11, "/f11.mkv", "f11.mkv", FILE_MODE, 1000);
    e.state = State::Caching;
    store.replace_entries(&[e]).unwrap();
    fs::write(tmp.path().join("11"), vec![0_u8; 1000]).unwrap();

    let cleaner = Cleaner::new(tmp.path().to_path_buf(), Arc::clone(&store), 100_000);
    cleaner.cleanup(60_000).unwrap();

    assert!(tmp.path().join("11").exists());
    assert_eq!(state_of(&store, 11), State::Caching);
}
