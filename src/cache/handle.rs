//! Per-file open object: reference counting across kernel opens, the
//! `NoCached -> Caching -> Cached` transition, and the power-manager lease
//! held while the source descriptor is in use.

use anyhow::{Context, Result, anyhow};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::power::PowerManager;
use crate::types::State;
use crate::utils::config::PromotionConsts;
use crate::utils::unix_now;

use super::chunks::FileChunks;
use super::strategy::ReadStrategy;

/// Bytes a reader must sustain on a file before it is promoted into the
/// cache: 15% of the size, clamped to [16 MiB, 64 MiB].
pub fn promotion_threshold(size: u64) -> u64 {
    let fraction = (size as f64 * PromotionConsts::SIZE_FRACTION) as u64;
    fraction.clamp(PromotionConsts::FLOOR_BYTES, PromotionConsts::CEIL_BYTES)
}

/// Bytes-read accumulator with a decay window. The value resets once the
/// window expires, so only sustained reading crosses the threshold.
pub struct ReadCounter {
    window_end: i64,
    value: u64,
}

impl ReadCounter {
    pub fn new() -> ReadCounter {
        ReadCounter {
            window_end: 0,
            value: 0,
        }
    }

    /// Add `n` bytes at time `now` and return the accumulated total.
    pub fn incr(&mut self, now: i64, n: u64) -> u64 {
        if self.window_end < now {
            self.window_end = now + PromotionConsts::WINDOW_SECS;
            self.value = 0;
        }
        self.value += n;
        self.value
    }
}

impl Default for ReadCounter {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    state: State,
    rc: u32,
    strategy: Option<ReadStrategy>,
    /// Chunk bookkeeping held between strategy teardowns while `Caching`.
    pending_chunks: Option<FileChunks>,
    counter: ReadCounter,
}

pub struct Handle {
    src_path: PathBuf,
    dst_path: PathBuf,
    size: u64,
    promote_limit: u64,
    power: Arc<dyn PowerManager>,
    inner: Mutex<Inner>,
}

impl Handle {
    /// Build a handle mirroring the stored state. A handle created in
    /// `Caching` gets its chunk bookkeeping eagerly so the copy can resume
    /// from chunk zero.
    pub fn new(
        src_path: PathBuf,
        dst_path: PathBuf,
        state: State,
        size: u64,
        power: Arc<dyn PowerManager>,
    ) -> Handle {
        let pending_chunks = match state {
            State::Caching => Some(FileChunks::new(size)),
            _ => None,
        };
        Handle {
            src_path,
            dst_path,
            size,
            promote_limit: promotion_threshold(size),
            power,
            inner: Mutex::new(Inner {
                state,
                rc: 0,
                strategy: None,
                pending_chunks,
                counter: ReadCounter::new(),
            }),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current in-memory state.
    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Increment the reference count, acquiring descriptors and the power
    /// lease on the 0 -> 1 transition.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rc == 0 {
            self.open_locked(&mut inner)?;
        }
        inner.rc += 1;
        Ok(())
    }

    /// Serve a read. While un-cached, every read feeds the promotion
    /// counter; crossing the threshold switches the handle to `Caching` in
    /// place and the returned flag tells the caller to start the background
    /// copy.
    pub fn read(&self, length: usize, offset: u64) -> Result<(bool, Vec<u8>)> {
        let mut inner = self.inner.lock().unwrap();
        let mut start_caching = false;
        if inner.state == State::NoCached {
            let total = inner.counter.incr(unix_now(), length as u64);
            if total >= self.promote_limit {
                self.promote_locked(&mut inner)?;
                start_caching = true;
            }
        }
        let strategy = inner
            .strategy
            .as_mut()
            .ok_or_else(|| anyhow!("read on a handle that is not open"))?;
        let data = strategy
            .read(length, offset)
            .with_context(|| format!("read {length} bytes at {offset}"))?;
        Ok((start_caching, data))
    }

    /// Advance the background copy by one chunk. Promotes first if still
    /// un-cached (prefetch of a file nobody has read yet). When the copy
    /// finishes, the handle reopens in `Cached` mode and the source lease
    /// is released. Returns false once fully cached.
    pub fn cache_next_chunk(&self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::NoCached {
            self.promote_locked(&mut inner)?;
        }
        if inner.state == State::Caching {
            let strategy = inner
                .strategy
                .as_mut()
                .ok_or_else(|| anyhow!("caching on a handle that is not open"))?;
            let more = strategy
                .cache_next_chunk()
                .context("copy next chunk to cache")?;
            if !more {
                self.close_locked(&mut inner);
                inner.pending_chunks = None;
                inner.state = State::Cached;
                self.open_locked(&mut inner)?;
            }
        }
        Ok(inner.state != State::Cached)
    }

    /// Decrement the reference count; the 1 -> 0 transition drops the
    /// strategy and releases the power lease. Returns whether the handle is
    /// now idle.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.rc > 0 {
            inner.rc -= 1;
            if inner.rc == 0 {
                self.close_locked(&mut inner);
            }
        }
        inner.rc == 0
    }

    fn open_locked(&self, inner: &mut Inner) -> Result<()> {
        let strategy = match inner.state {
            // The lease is taken before touching the source so the remote
            // side wakes the disk; a failed open must hand it back.
            State::NoCached => {
                self.power.acquire();
                match File::open(&self.src_path)
                    .with_context(|| format!("open source {}", self.src_path.display()))
                {
                    Ok(src) => ReadStrategy::Direct(src),
                    Err(e) => {
                        self.power.release();
                        return Err(e);
                    }
                }
            }
            State::Caching => {
                self.power.acquire();
                match self.open_copy_pair() {
                    Ok((src, dst)) => {
                        let chunks = inner
                            .pending_chunks
                            .take()
                            .unwrap_or_else(|| FileChunks::new(self.size));
                        ReadStrategy::Hybrid { src, dst, chunks }
                    }
                    Err(e) => {
                        self.power.release();
                        return Err(e);
                    }
                }
            }
            State::Cached => {
                let dst = File::open(&self.dst_path)
                    .with_context(|| format!("open cache file {}", self.dst_path.display()))?;
                ReadStrategy::Direct(dst)
            }
        };
        inner.strategy = Some(strategy);
        Ok(())
    }

    fn open_copy_pair(&self) -> Result<(File, File)> {
        let src = File::open(&self.src_path)
            .with_context(|| format!("open source {}", self.src_path.display()))?;
        let dst = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.dst_path)
            .with_context(|| format!("open cache file {}", self.dst_path.display()))?;
        // Pre-extend so every chunk writes at its final offset.
        dst.set_len(self.size)
            .with_context(|| format!("extend cache file {}", self.dst_path.display()))?;
        Ok((src, dst))
    }

    fn close_locked(&self, inner: &mut Inner) {
        if matches!(inner.state, State::NoCached | State::Caching) {
            self.power.release();
        }
        if let Some(strategy) = inner.strategy.take()
            && inner.state == State::Caching
            && let Some(chunks) = strategy.into_chunks()
        {
            inner.pending_chunks = Some(chunks);
        }
    }

    fn promote_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.pending_chunks = Some(FileChunks::new(self.size));
        self.close_locked(inner);
        inner.state = State::Caching;
        self.open_locked(inner)
    }
}
