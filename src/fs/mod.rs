//! Filesystem façade: maps virtual paths to reference-counted handles,
//! schedules prefetch of playback neighbours, and drives the background
//! cacher thread.

pub mod fuse;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::cache::Handle;
use crate::cleaner::Cleaner;
use crate::power::PowerManager;
use crate::store::Store;
use crate::types::{State, StatRow};
use crate::utils::config::QueueConsts;
use crate::utils::unix_now;

/// How much to cache ahead of the reader: a playtime bound for the prefetch
/// scan and a byte bound under which opening a cached file pulls in its
/// successor.
#[derive(Clone, Copy, Debug)]
pub struct PrefetchBudget {
    pub seconds: i64,
    pub bytes: u64,
}

pub struct Filesystem {
    src_path: PathBuf,
    cache_path: PathBuf,
    store: Arc<Store>,
    power: Arc<dyn PowerManager>,
    cleaner: Arc<Cleaner>,
    prefetch: PrefetchBudget,
    handles: Mutex<HashMap<i64, Arc<Handle>>>,
    work_tx: Sender<Option<String>>,
    work_rx: Receiver<Option<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Filesystem {
    pub fn new(
        src_path: PathBuf,
        cache_path: PathBuf,
        store: Arc<Store>,
        power: Arc<dyn PowerManager>,
        cleaner: Arc<Cleaner>,
        prefetch: PrefetchBudget,
    ) -> Filesystem {
        let (work_tx, work_rx) = bounded(QueueConsts::CACHER_QUEUE_CAP);
        Filesystem {
            src_path,
            cache_path,
            store,
            power,
            cleaner,
            prefetch,
            handles: Mutex::new(HashMap::new()),
            work_tx,
            work_rx,
            worker: Mutex::new(None),
        }
    }

    pub fn get_attr(&self, path: &str) -> Result<Option<StatRow>> {
        self.store.get_attr(path)
    }

    /// Sorted child names of a directory, or none for an unknown path.
    pub fn read_dir(&self, path: &str) -> Result<Option<Vec<String>>> {
        let Some(id) = self.store.get_id(path)? else {
            return Ok(None);
        };
        let mut names = self.store.get_children_names(id)?;
        names.sort();
        Ok(Some(names))
    }

    /// Open a virtual path. Returns the entry id, which doubles as the
    /// kernel file handle.
    pub fn open(&self, path: &str) -> Result<Option<i64>> {
        let mut handles = self.handles.lock().unwrap();
        let Some((id, state, size)) = self.store.get_id_state_size(path)? else {
            return Ok(None);
        };
        self.open_locked(&mut handles, id, path, state, size)?;
        self.store.set_last_access_ts(id, unix_now())?;
        Ok(Some(id))
    }

    /// Get or create the handle for `id` and reference it. A handle newly
    /// created in `Cached` state under the prefetch byte budget pulls the
    /// next un-cached regular file into the cache queue.
    fn open_locked(
        &self,
        handles: &mut HashMap<i64, Arc<Handle>>,
        id: i64,
        path: &str,
        state: State,
        size: u64,
    ) -> Result<Arc<Handle>> {
        let handle = match handles.get(&id) {
            Some(handle) => Arc::clone(handle),
            None => {
                let handle = Arc::new(Handle::new(
                    self.src_path.join(path.trim_start_matches('/')),
                    self.cache_path.join(id.to_string()),
                    state,
                    size,
                    Arc::clone(&self.power),
                ));
                handles.insert(id, Arc::clone(&handle));
                if state == State::Cached
                    && size < self.prefetch.bytes
                    && let Some((next_path, next_state)) =
                        self.store.get_next_file_path_state(path)?
                    && next_state == State::NoCached
                {
                    self.cache_next_files(&next_path)?;
                }
                handle
            }
        };
        handle.open()?;
        Ok(handle)
    }

    /// Serve a kernel read. A promotion reported by the handle triggers
    /// prefetch from this path.
    pub fn read(&self, path: &str, fh: i64, length: usize, offset: u64) -> Result<Option<Vec<u8>>> {
        let handle = {
            let handles = self.handles.lock().unwrap();
            match handles.get(&fh) {
                Some(handle) => Arc::clone(handle),
                None => return Ok(None),
            }
        };
        let (start_caching, data) = handle.read(length, offset)?;
        if start_caching {
            self.cache_next_files(path)?;
        }
        Ok(Some(data))
    }

    /// Release one kernel reference on `fh`. Returns whether the handle
    /// existed.
    pub fn close(&self, fh: i64) -> Result<bool> {
        let mut handles = self.handles.lock().unwrap();
        let Some(handle) = handles.get(&fh).map(Arc::clone) else {
            return Ok(false);
        };
        Self::close_locked(&mut handles, &handle, fh);
        Ok(true)
    }

    fn close_locked(handles: &mut HashMap<i64, Arc<Handle>>, handle: &Handle, id: i64) {
        if handle.close() {
            handles.remove(&id);
        }
    }

    /// Queue the un-cached files after `path` in playlist order, within the
    /// prefetch playtime budget. Each is stamped slightly in the past so
    /// eviction order tracks prefetch order, then flipped to `Caching`
    /// before it is queued so a second scan will not pick it again.
    fn cache_next_files(&self, path: &str) -> Result<()> {
        let to_cache = self
            .store
            .get_next_files_to_cache(path, self.prefetch.seconds)?;
        let ts = unix_now();
        for (i, (id, path, _size)) in to_cache.into_iter().enumerate() {
            log::debug!("queueing '{path}' with id {id} for caching");
            self.store.set_last_access_ts(id, ts - i as i64)?;
            self.store.set_state(id, State::NoCached, State::Caching)?;
            if self.work_tx.try_send(Some(path)).is_err() {
                log::warn!("cacher queue full, dropping id {id}");
                self.store.set_state(id, State::Caching, State::NoCached)?;
            }
        }
        Ok(())
    }

    /// Re-resolve a queued path, reference its handle, and re-stamp its
    /// last access. Used by the background cacher.
    fn touch_file(&self, path: &str) -> Result<Option<(Arc<Handle>, i64)>> {
        let mut handles = self.handles.lock().unwrap();
        let Some((id, state, size)) = self.store.get_id_state_size(path)? else {
            return Ok(None);
        };
        let handle = self.open_locked(&mut handles, id, path, state, size)?;
        self.store.set_last_access_ts(id, unix_now())?;
        Ok(Some((handle, id)))
    }

    pub fn start(self: &Arc<Self>) {
        let fs = Arc::clone(self);
        let rx = self.work_rx.clone();
        let handle = thread::spawn(move || fs.run_cacher(rx));
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        let _ = self.work_tx.send(None);
        if let Some(handle) = self.worker.lock().unwrap().take()
            && handle.join().is_err()
        {
            log::error!("cacher worker panicked");
        }
    }

    fn run_cacher(&self, rx: Receiver<Option<String>>) {
        while let Ok(Some(path)) = rx.recv() {
            if let Err(e) = self.cache_one(&path) {
                log::error!("caching '{path}' failed: {e:#}");
            }
        }
    }

    /// Copy one queued file to the cache end to end, then persist the
    /// `Cached` state and drop the worker's reference.
    fn cache_one(&self, path: &str) -> Result<()> {
        let Some((handle, id)) = self.touch_file(path)? else {
            return Ok(());
        };
        self.cleaner.to_add(handle.size());
        log::debug!("caching the file with id {id}");
        let copied = (|| -> Result<()> {
            while handle.cache_next_chunk()? {}
            Ok(())
        })();
        if copied.is_ok() {
            log::debug!("cached the file with id {id}");
            self.store.set_state(id, State::Caching, State::Cached)?;
        }
        let mut handles = self.handles.lock().unwrap();
        Self::close_locked(&mut handles, &handle, id);
        copied
    }
}
