//! Change-notification feed: newline-delimited JSON events over TCP from
//! the source host, applied to the indexer and optionally forwarded
//! downstream.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};

use crate::indexer::Indexer;

pub const MASK_CLOSE_WRITE: u32 = 0x0000_0008;
pub const MASK_MOVED_FROM: u32 = 0x0000_0040;
pub const MASK_MOVED_TO: u32 = 0x0000_0080;
pub const MASK_CREATE: u32 = 0x0000_0100;
pub const MASK_DELETE: u32 = 0x0000_0200;

/// One filesystem event from the source host. `path` is the directory
/// relative to the source root, `name` the affected basename.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeedEvent {
    pub mask: u32,
    pub path: String,
    pub name: String,
}

impl FeedEvent {
    /// True when any selector has all of its bits set in the event mask.
    pub fn matches(&self, selectors: &[u32]) -> bool {
        selectors.iter().any(|s| s & self.mask == *s)
    }
}

/// Forwards events to a downstream feed consumer after local processing.
pub struct FeedProxy {
    addr: String,
}

impl FeedProxy {
    pub fn new(addr: String) -> FeedProxy {
        FeedProxy { addr }
    }

    pub fn notify(&self, event: &FeedEvent) -> Result<()> {
        let mut stream = TcpStream::connect(&self.addr)
            .with_context(|| format!("connect to feed forward {}", self.addr))?;
        let line = serde_json::to_string(event).context("encode feed event")?;
        writeln!(stream, "{line}").context("forward feed event")?;
        Ok(())
    }
}

/// Bind the feed listener and consume events on a background thread. Each
/// connection carries one JSON event per line; malformed lines are logged
/// and skipped.
pub fn spawn_listener(addr: &str, mut indexer: Indexer) -> Result<JoinHandle<()>> {
    let listener =
        TcpListener::bind(addr).with_context(|| format!("bind change feed on {addr}"))?;
    log::debug!("change feed listening on {addr}");
    Ok(thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("change feed accept failed: {e}");
                    continue;
                }
            };
            for line in BufReader::new(stream).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("change feed read failed: {e}");
                        break;
                    }
                };
                match serde_json::from_str::<FeedEvent>(&line) {
                    Ok(event) => indexer.notify(&event),
                    Err(e) => log::warn!("discarding malformed feed event: {e}"),
                }
            }
        }
    }))
}
