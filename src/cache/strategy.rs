//! The two ways to serve a read: straight from one descriptor, or through
//! the cache after making sure the needed chunks have been copied.
//!
//! Closing a strategy is dropping it; the owned descriptors close with it.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use super::chunks::FileChunks;

pub enum ReadStrategy {
    /// Single descriptor, pread only. Serves un-cached and fully-cached files.
    Direct(File),
    /// Source plus cache descriptors; reads are served from the cache after
    /// the overlapping chunks have been copied.
    Hybrid {
        src: File,
        dst: File,
        chunks: FileChunks,
    },
}

impl ReadStrategy {
    pub fn read(&mut self, length: usize, offset: u64) -> io::Result<Vec<u8>> {
        match self {
            ReadStrategy::Direct(file) => read_up_to(file, length, offset),
            ReadStrategy::Hybrid { src, dst, chunks } => {
                chunks.ensure_in_cache(src, dst, length, offset)?;
                read_up_to(dst, length, offset)
            }
        }
    }

    /// Advance the linear copy by one chunk. Direct strategies have nothing
    /// to copy and always report done.
    pub fn cache_next_chunk(&mut self) -> io::Result<bool> {
        match self {
            ReadStrategy::Direct(_) => Ok(false),
            ReadStrategy::Hybrid { src, dst, chunks } => chunks.cache_next_chunk(src, dst),
        }
    }

    /// Salvage the chunk bookkeeping when tearing down mid-copy.
    pub fn into_chunks(self) -> Option<FileChunks> {
        match self {
            ReadStrategy::Direct(_) => None,
            ReadStrategy::Hybrid { chunks, .. } => Some(chunks),
        }
    }
}

/// pread up to `length` bytes at `offset`, short only at end of file.
pub fn read_up_to(file: &File, length: usize, offset: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0_u8; length];
    let mut filled = 0_usize;
    while filled < length {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
