//! Cache eviction worker: keeps the cache directory under a byte budget
//! and reconciles disk contents with the store.
//!
//! Cleanup runs three passes in a fixed order: un-mark rows whose cache
//! file vanished, evict the oldest rows until the retention target is met,
//! then delete files the store no longer vouches for. The running byte
//! count between cleanups is advisory; every cleanup re-seeds it from the
//! store.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::store::Store;
use crate::types::State;
use crate::utils::config::EvictionConsts;

pub struct Cleaner {
    cache_path: PathBuf,
    store: Arc<Store>,
    limit_bytes: u64,
    tx: Sender<Option<u64>>,
    rx: Receiver<Option<u64>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Cleaner {
    pub fn new(cache_path: PathBuf, store: Arc<Store>, limit_bytes: u64) -> Cleaner {
        let (tx, rx) = unbounded();
        Cleaner {
            cache_path,
            store,
            limit_bytes,
            tx,
            rx,
            worker: Mutex::new(None),
        }
    }

    /// Report bytes about to be added to the cache directory.
    pub fn to_add(&self, n_bytes: u64) {
        let _ = self.tx.send(Some(n_bytes));
    }

    pub fn start(self: &Arc<Self>) {
        let cleaner = Arc::clone(self);
        let rx = self.rx.clone();
        let handle = thread::spawn(move || cleaner.run(rx));
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(None);
        if let Some(handle) = self.worker.lock().unwrap().take()
            && handle.join().is_err()
        {
            log::error!("cleaner worker panicked");
        }
    }

    fn run(&self, rx: Receiver<Option<u64>>) {
        let target = (self.limit_bytes as f64 * EvictionConsts::RETENTION_FACTOR) as u64;
        let mut used_bytes = self.run_cleanup(target);

        while let Ok(Some(n_bytes)) = rx.recv() {
            used_bytes += n_bytes;
            if used_bytes > self.limit_bytes {
                used_bytes = self.run_cleanup(target);
            }
        }
    }

    fn run_cleanup(&self, target: u64) -> u64 {
        match self.cleanup(target) {
            Ok(used) => used,
            Err(e) => {
                log::error!("cache cleanup failed: {e:#}");
                0
            }
        }
    }

    /// One full cleanup pass. Returns the cached bytes remaining according
    /// to the store.
    pub fn cleanup(&self, target_bytes: u64) -> Result<u64> {
        self.uncache_removed_files()?;
        let used_bytes = self.uncache_old_files(target_bytes)?;
        self.remove_stray_files()?;
        Ok(used_bytes)
    }

    /// Rows claiming `Cached` whose file is gone from disk get flipped back.
    fn uncache_removed_files(&self) -> Result<()> {
        for id in self.store.get_cached_ids()? {
            if !self.cache_path.join(id.to_string()).exists() {
                log::warn!("un-marking removed cache file with id {id}");
                self.store.set_state(id, State::Cached, State::NoCached)?;
            }
        }
        Ok(())
    }

    /// Evict oldest-accessed rows until the target is met or no cached rows
    /// remain. Returns the remaining cached byte count.
    fn uncache_old_files(&self, target_bytes: u64) -> Result<u64> {
        let mut used_bytes = self.store.get_cached_bytes()?;
        while used_bytes > target_bytes {
            let (has_more, rows) = self
                .store
                .get_oldest_cached_files(EvictionConsts::PAGE_SIZE)?;
            for (id, n_bytes) in rows {
                log::debug!("un-marking old cache file with id {id}");
                self.store.set_state(id, State::Cached, State::NoCached)?;
                used_bytes = used_bytes.saturating_sub(n_bytes);
                if used_bytes <= target_bytes {
                    break;
                }
            }
            if !has_more {
                break;
            }
        }
        Ok(used_bytes)
    }

    /// Delete cache files the store no longer vouches for: names that are
    /// not ids, ids that are gone, un-cached rows, and cached rows whose
    /// on-disk length disagrees with the stored size (those rows are also
    /// flipped back to un-cached). Files mid-copy are left alone.
    fn remove_stray_files(&self) -> Result<()> {
        let entries = fs::read_dir(&self.cache_path)
            .with_context(|| format!("list cache dir {}", self.cache_path.display()))?;
        for entry in entries {
            let entry = entry.context("read cache dir entry")?;
            let file_type = entry.file_type().context("stat cache dir entry")?;
            if !file_type.is_file() {
                continue;
            }
            if !self.is_valid_cache_file(&entry)? {
                log::debug!("removing the cache file '{}'", entry.path().display());
                if let Err(e) = fs::remove_file(entry.path()) {
                    log::error!("error removing cache file '{}': {e}", entry.path().display());
                }
            }
        }
        Ok(())
    }

    fn is_valid_cache_file(&self, entry: &fs::DirEntry) -> Result<bool> {
        let name = entry.file_name();
        let id: i64 = match name.to_str().and_then(|s| s.parse().ok()) {
            Some(id) => id,
            None => {
                log::warn!("cache file '{}' is not an id", name.to_string_lossy());
                return Ok(false);
            }
        };
        let (state, size) = match self.store.get_state_size(id)? {
            Some(row) => row,
            None => return Ok(false),
        };
        if state == State::NoCached {
            return Ok(false);
        }
        let on_disk = entry.metadata().context("stat cache file")?.len();
        if state == State::Cached && size != on_disk {
            self.store.set_state(id, State::Cached, State::NoCached)?;
            return Ok(false);
        }
        Ok(true)
    }
}
