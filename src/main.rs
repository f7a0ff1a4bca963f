//! spoolfs daemon: wire the store, power manager, indexer, change feed,
//! cleaner, and façade together, then mount and wait for a signal.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use spoolfs::cleaner::Cleaner;
use spoolfs::cli::Cli;
use spoolfs::feed::{self, FeedProxy};
use spoolfs::fs::fuse::{SpoolFuse, mount_options};
use spoolfs::fs::{Filesystem, PrefetchBudget};
use spoolfs::indexer::Indexer;
use spoolfs::power::{HttpPowerManager, PowerManager};
use spoolfs::probe::{DurationProbe, ExifToolProbe};
use spoolfs::store::Store;
use spoolfs::types::State;
use spoolfs::utils::config::GIB;
use spoolfs::utils::setup_logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    log::debug!("starting store");
    let store = Arc::new(Store::open(&cli.db_path)?);

    log::debug!("starting power manager");
    let power: Arc<dyn PowerManager> =
        Arc::new(HttpPowerManager::new(&cli.pm_address, &cli.pm_token_id)?);

    let probe: Arc<dyn DurationProbe> = Arc::new(ExifToolProbe);
    let proxy = cli.feed_forward.clone().map(FeedProxy::new);

    log::debug!("starting indexer");
    let mut indexer = Indexer::new(
        &cli.src_path,
        Arc::clone(&store),
        proxy,
        Arc::clone(&power),
        probe,
    )?;

    if cli.rebuild {
        indexer.rebuild()?;
    } else {
        // In-progress copies do not survive a restart.
        store.set_states(State::Caching, State::NoCached)?;
    }

    log::debug!("starting change feed listener");
    // The listener thread lives for the whole process; it dies with it.
    let _feed_thread = feed::spawn_listener(&cli.feed_listen, indexer)?;

    log::debug!("starting cleaner");
    let cleaner = Arc::new(Cleaner::new(
        cli.cache_path.clone(),
        Arc::clone(&store),
        cli.cache_limit * GIB,
    ));
    cleaner.start();

    log::debug!("starting filesystem");
    let fs = Arc::new(Filesystem::new(
        cli.src_path.clone(),
        cli.cache_path.clone(),
        Arc::clone(&store),
        power,
        Arc::clone(&cleaner),
        PrefetchBudget {
            seconds: cli.prefetch_min * 60,
            bytes: cli.prefetch_gib * GIB,
        },
    ));
    fs.start();

    log::info!("mounting at {}", cli.fuse_path.display());
    let session = fuser::spawn_mount2(
        SpoolFuse::new(Arc::clone(&fs), store),
        &cli.fuse_path,
        &mount_options(),
    )
    .with_context(|| format!("mount at {}", cli.fuse_path.display()))?;

    let (sig_tx, sig_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = sig_tx.try_send(());
    })
    .context("install signal handler")?;

    let _ = sig_rx.recv();
    log::info!("shutting down");
    fs.stop();
    cleaner.stop();
    drop(session);
    Ok(())
}
