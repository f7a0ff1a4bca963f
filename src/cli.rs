use clap::Parser;
use std::path::PathBuf;

struct DefaultArgs;

impl DefaultArgs {
    pub const DB_PATH: &'static str = "db.sqlite";
    pub const PM_ADDRESS: &'static str = "http://127.0.0.1:9353";
    pub const FEED_LISTEN: &'static str = "127.0.0.1:4444";
}

/// Expose a slow media tree as a local read-only mount backed by a disk cache.
#[derive(Clone, Parser)]
#[command(name = "spoolfs")]
#[command(about = "Mount a remote media tree read-only, caching watched files on local storage.")]
pub struct Cli {
    /// Source directory to mirror.
    #[arg(value_name = "SRC_PATH")]
    pub src_path: PathBuf,

    /// Mount point for the virtual filesystem.
    #[arg(value_name = "FUSE_PATH")]
    pub fuse_path: PathBuf,

    /// Directory holding cached file contents.
    #[arg(value_name = "CACHE_PATH")]
    pub cache_path: PathBuf,

    /// Path of the sqlite database.
    #[arg(long, default_value = DefaultArgs::DB_PATH)]
    pub db_path: PathBuf,

    /// Power manager address.
    #[arg(long, default_value = DefaultArgs::PM_ADDRESS)]
    pub pm_address: String,

    /// Power manager token id.
    #[arg(long, default_value = env!("CARGO_PKG_NAME"))]
    pub pm_token_id: String,

    /// Change-feed listen address (<host>:<port>).
    #[arg(long, default_value = DefaultArgs::FEED_LISTEN)]
    pub feed_listen: String,

    /// Forward change-feed events to this address (<host>:<port>) after local processing.
    #[arg(long)]
    pub feed_forward: Option<String>,

    /// Cache size limit in gibibytes.
    #[arg(long, default_value_t = 180)]
    pub cache_limit: u64,

    /// Maximum playtime of prefetched content, in minutes.
    #[arg(long, default_value_t = 180)]
    pub prefetch_min: i64,

    /// Prefetch byte budget in gibibytes.
    #[arg(long, default_value_t = 10)]
    pub prefetch_gib: u64,

    /// Purge the database and re-index the source tree.
    #[arg(long)]
    pub rebuild: bool,

    /// Verbose output. Default: false.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
