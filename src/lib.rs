//! spoolfs: a read-only FUSE view of a slow media tree with a read-through
//! disk cache. Files that look like they are being watched get promoted
//! onto local storage, their playback neighbours are prefetched, and the
//! cache is evicted under a byte budget.

pub mod cache;
pub mod cleaner;
pub mod cli;
pub mod feed;
pub mod fs;
pub mod indexer;
pub mod power;
pub mod probe;
pub mod store;
pub mod types;
pub mod utils;

/// Re-export core types for API
pub use types::*;
