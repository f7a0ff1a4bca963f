//! Application configuration constants.
//! Tuning and thresholds in one place.

// ---- Units ----

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

// ---- Chunked copy ----

/// Chunk size as a power of two. Chunks are the unit of the source-to-cache copy.
pub const CHUNK_SIZE_BITS: u32 = 18;

/// Chunk size in bytes (256 KiB).
pub const CHUNK_SIZE: u64 = 1 << CHUNK_SIZE_BITS;

// ---- Promotion ----

/// Thresholds for promoting a file from pass-through to cached serving.
pub struct PromotionConsts;

impl PromotionConsts {
    /// Lower bound of the promotion threshold.
    pub const FLOOR_BYTES: u64 = 16 * MIB;
    /// Upper bound of the promotion threshold.
    pub const CEIL_BYTES: u64 = 64 * MIB;
    /// Fraction of the file size used between the bounds.
    pub const SIZE_FRACTION: f64 = 0.15;
    /// Read-volume counter decay window in seconds.
    pub const WINDOW_SECS: i64 = 300;
}

// ---- Prefetch ----

/// Row limits for the playlist-order prefetch queries.
pub struct PrefetchConsts;

impl PrefetchConsts {
    /// Upper bound of rows scanned when accumulating prefetch candidates.
    pub const SCAN_LIMIT: usize = 50;
    /// Candidates inspected when looking for the next regular file after an open.
    pub const NEXT_FILE_SCAN: usize = 8;
}

// ---- Worker queues ----

/// Bounds for the background worker queues.
pub struct QueueConsts;

impl QueueConsts {
    /// Capacity of the background cacher's work queue. Prefetch batches are
    /// small, so hitting this bound means something is badly wedged; the
    /// enqueue side drops and reverts instead of blocking.
    pub const CACHER_QUEUE_CAP: usize = 1024;
}

// ---- Eviction ----

/// Cache eviction tuning.
pub struct EvictionConsts;

impl EvictionConsts {
    /// Multiplier applied to the cache byte budget to get the post-cleanup target.
    pub const RETENTION_FACTOR: f64 = 0.6;
    /// Page size when walking the oldest cached rows.
    pub const PAGE_SIZE: usize = 50;
}
