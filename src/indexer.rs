//! Indexer: walks the source tree into the store on rebuild and applies
//! change-feed events incrementally.
//!
//! The rebuild walk pushes children reverse-sorted onto a depth-first
//! stack, so rows land in the store in forward traversal order and ids
//! stay dense. Each subtree is inserted in one transaction, with a single
//! power lease held for the duration of the walk.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::feed::{
    FeedEvent, FeedProxy, MASK_CLOSE_WRITE, MASK_CREATE, MASK_DELETE, MASK_MOVED_FROM,
    MASK_MOVED_TO,
};
use crate::power::PowerManager;
use crate::probe::DurationProbe;
use crate::store::Store;
use crate::types::{Entry, ROOT_PARENT_ID, State, StatRow};

pub struct Indexer {
    src_path: PathBuf,
    store: Arc<Store>,
    proxy: Option<FeedProxy>,
    power: Arc<dyn PowerManager>,
    probe: Arc<dyn DurationProbe>,
    next_id: i64,
}

/// Join feed-event components under the virtual root. Empty components
/// vanish, so `("", "b")` is `/b` and `("", "")` is the root itself.
pub fn join_virtual(path: &str, name: &str) -> String {
    let mut out = String::from("/");
    for part in [path, name] {
        let part = part.trim_matches('/');
        if part.is_empty() {
            continue;
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

impl Indexer {
    pub fn new(
        src_path: &Path,
        store: Arc<Store>,
        proxy: Option<FeedProxy>,
        power: Arc<dyn PowerManager>,
        probe: Arc<dyn DurationProbe>,
    ) -> Result<Indexer> {
        let src_path = fs::canonicalize(src_path)
            .with_context(|| format!("canonicalize source path {}", src_path.display()))?;
        let next_id = store.get_largest_id()? + 1;
        Ok(Indexer {
            src_path,
            store,
            proxy,
            power,
            probe,
            next_id,
        })
    }

    /// Drop the whole index and re-walk the source tree, reassigning ids
    /// from zero.
    pub fn rebuild(&mut self) -> Result<()> {
        log::info!("indexing files under {}", self.src_path.display());
        self.store.purge()?;
        self.next_id = 0;
        let root = self.src_path.clone();
        self.setup_and_add_path(ROOT_PARENT_ID, &root)
    }

    /// Apply one change-feed event. Failures are logged; the next event
    /// drives forward progress.
    pub fn notify(&mut self, event: &FeedEvent) {
        if event.matches(&[MASK_MOVED_FROM, MASK_DELETE]) {
            let vpath = join_virtual(&event.path, &event.name);
            if let Err(e) = self.remove_path(&vpath) {
                log::error!("removing '{vpath}' failed: {e:#}");
            }
        }
        if event.matches(&[MASK_CLOSE_WRITE, MASK_MOVED_TO, MASK_CREATE]) {
            if let Err(e) = self.add_created(event) {
                log::error!(
                    "adding '{}' failed: {e:#}",
                    join_virtual(&event.path, &event.name)
                );
            }
        }
        if let Some(proxy) = &self.proxy
            && let Err(e) = proxy.notify(event)
        {
            log::warn!("forwarding feed event failed: {e:#}");
        }
    }

    fn add_created(&mut self, event: &FeedEvent) -> Result<()> {
        let parent_vpath = join_virtual(&event.path, "");
        let Some(parent_id) = self.store.get_id(&parent_vpath)? else {
            return Ok(());
        };
        let abs = self.src_path.join(&event.path).join(&event.name);
        self.setup_and_add_path(parent_id, &abs)
    }

    /// Walk one subtree into the store under a single power lease.
    fn setup_and_add_path(&mut self, parent_id: i64, path: &Path) -> Result<()> {
        self.power.acquire();
        let res = self.add_path(parent_id, path);
        self.power.release();
        res
    }

    fn add_path(&mut self, parent_id: i64, path: &Path) -> Result<()> {
        let mut to_check = vec![(parent_id, path.to_path_buf())];
        let mut entries = Vec::new();
        while let Some((parent_id, path)) = to_check.pop() {
            let meta =
                fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
            let id = self.next_id;
            entries.push(self.build_entry(id, parent_id, &path, &meta));
            if meta.is_dir() {
                let mut children = Vec::new();
                let dir = fs::read_dir(&path)
                    .with_context(|| format!("list directory {}", path.display()))?;
                for child in dir {
                    children.push(child.context("read directory entry")?.path());
                }
                children.sort();
                for child in children.into_iter().rev() {
                    to_check.push((id, child));
                }
            }
            self.next_id += 1;
        }
        self.store.replace_entries(&entries)
    }

    fn remove_path(&mut self, vpath: &str) -> Result<()> {
        let Some(id) = self.store.get_id(vpath)? else {
            return Ok(());
        };
        let mut to_remove = vec![id];
        while let Some(id) = to_remove.pop() {
            to_remove.extend(self.store.get_children_ids(id)?);
            self.store.remove_entry(id)?;
        }
        Ok(())
    }

    fn build_entry(&self, id: i64, parent_id: i64, path: &Path, meta: &fs::Metadata) -> Entry {
        log::debug!("creating entry of path '{}' with id {id}", path.display());
        let vpath = self.virtual_path(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| vpath.clone());
        let duration = if meta.is_file() {
            self.probe.duration_secs(path)
        } else {
            None
        };
        Entry {
            id,
            parent_id,
            path: vpath,
            name,
            state: State::NoCached,
            last_access_ts: None,
            duration,
            stat: StatRow {
                mode: meta.mode(),
                // The assigned id is the inode the kernel will see.
                ino: id as u64,
                dev: meta.dev(),
                nlink: meta.nlink(),
                uid: meta.uid(),
                gid: meta.gid(),
                size: meta.size(),
                atime: meta.atime(),
                ctime: meta.ctime(),
                mtime: meta.mtime(),
            },
        }
    }

    fn virtual_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.src_path) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => format!("/{}", path.to_string_lossy().trim_start_matches('/')),
        }
    }
}
