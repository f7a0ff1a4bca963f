//! Kernel glue: read-only fuser binding over the façade.
//!
//! Store ids are dense from zero while the kernel reserves node id 1 for
//! the root, so node ids are `id + 1` throughout — including `FileAttr.ino`,
//! which is what the kernel adopts as the node id from a lookup reply.
//! Unknown paths reply ENOENT, everything else that fails replies EIO.
//! Write-side operations are left unimplemented.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, Request,
};

use crate::store::Store;
use crate::types::StatRow;

use super::Filesystem;

/// TTL for kernel-side attribute caching.
const TTL: Duration = Duration::from_secs(1);

pub struct SpoolFuse {
    fs: Arc<Filesystem>,
    store: Arc<Store>,
}

impl SpoolFuse {
    pub fn new(fs: Arc<Filesystem>, store: Arc<Store>) -> SpoolFuse {
        SpoolFuse { fs, store }
    }
}

/// Options for the read-only mount.
pub fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::RO,
        MountOption::FSName("spoolfs".to_string()),
        MountOption::AllowOther,
        MountOption::AutoUnmount,
    ]
}

/// Store id of a kernel node id.
pub fn id_of(ino: u64) -> i64 {
    ino as i64 - 1
}

/// Kernel node id of a store id.
pub fn ino_of(id: i64) -> u64 {
    (id + 1) as u64
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn time_of(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// Kernel attributes for one entry. `ino` must be the node id: the kernel
/// takes the node id for subsequent operations from the attributes a
/// lookup returns, so it has to agree with what readdir advertises.
pub fn attr_of(id: i64, stat: &StatRow) -> FileAttr {
    FileAttr {
        ino: ino_of(id),
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: time_of(stat.atime),
        mtime: time_of(stat.mtime),
        ctime: time_of(stat.ctime),
        crtime: UNIX_EPOCH,
        kind: kind_of(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink as u32,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

impl fuser::Filesystem for SpoolFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.store.get_child_attr(id_of(parent), name) {
            Ok(Some((id, stat))) => reply.entry(&TTL, &attr_of(id, &stat), 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => {
                log::error!("lookup of '{name}' failed: {e:#}");
                reply.error(libc::EIO);
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let id = id_of(ino);
        match self.store.get_attr_by_id(id) {
            Ok(Some(stat)) => reply.attr(&TTL, &attr_of(id, &stat)),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => {
                log::error!("getattr of id {id} failed: {e:#}");
                reply.error(libc::EIO);
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let id = id_of(ino);
        // The root's parent id is the -1 sentinel; its `..` stays itself.
        let parent_ino = match self.store.get_parent_id(id) {
            Ok(Some(parent_id)) if parent_id >= 0 => ino_of(parent_id),
            Ok(Some(_)) => ino,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                log::error!("readdir of id {id} failed: {e:#}");
                reply.error(libc::EIO);
                return;
            }
        };
        let children = match self.store.get_children_dirents(id) {
            Ok(children) => children,
            Err(e) => {
                log::error!("readdir of id {id} failed: {e:#}");
                reply.error(libc::EIO);
                return;
            }
        };
        let dots = [
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        let entries = dots.into_iter().chain(
            children
                .into_iter()
                .map(|(id, name, mode)| (ino_of(id), kind_of(mode), name)),
        );
        for (i, (entry_ino, kind, name)) in entries.enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let id = id_of(ino);
        let opened = self
            .store
            .get_path(id)
            .and_then(|path| match path {
                Some(path) => self.fs.open(&path),
                None => Ok(None),
            });
        match opened {
            Ok(Some(fh)) => reply.opened(fh as u64, 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => {
                log::error!("open of id {id} failed: {e:#}");
                reply.error(libc::EIO);
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let id = id_of(ino);
        let data = self.store.get_path(id).and_then(|path| match path {
            Some(path) => self
                .fs
                .read(&path, fh as i64, size as usize, offset.max(0) as u64),
            None => Ok(None),
        });
        match data {
            Ok(Some(data)) => reply.data(&data),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => {
                log::error!("read of id {id} failed: {e:#}");
                reply.error(libc::EIO);
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.close(fh as i64) {
            Ok(true) => reply.ok(),
            Ok(false) => reply.error(libc::ENOENT),
            Err(e) => {
                log::error!("release of fh {fh} failed: {e:#}");
                reply.error(libc::EIO);
            }
        }
    }
}
