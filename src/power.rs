//! Power-manager client: a reference on the remote service keeps the
//! source storage awake while any handle still reads from it.

use anyhow::{Context, Result};
use std::sync::Mutex;
use std::time::Duration;

pub trait PowerManager: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// HTTP client with a caller-side reference count. Only the 0 -> 1 and
/// 1 -> 0 edges reach the remote service; RPC failures are logged and
/// never propagate into the read path.
pub struct HttpPowerManager {
    base_url: String,
    token_id: String,
    client: reqwest::blocking::Client,
    refs: Mutex<u64>,
}

impl HttpPowerManager {
    pub fn new(address: &str, token_id: &str) -> Result<HttpPowerManager> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build power manager http client")?;
        Ok(HttpPowerManager {
            base_url: address.trim_end_matches('/').to_string(),
            token_id: token_id.to_string(),
            client,
            refs: Mutex::new(0),
        })
    }

    fn post(&self, op: &str) -> Result<()> {
        self.client
            .post(format!("{}/{op}", self.base_url))
            .json(&serde_json::json!({ "token_id": self.token_id }))
            .send()
            .with_context(|| format!("power manager {op} request"))?
            .error_for_status()
            .with_context(|| format!("power manager {op} response"))?;
        Ok(())
    }
}

impl PowerManager for HttpPowerManager {
    fn acquire(&self) {
        let mut refs = self.refs.lock().unwrap();
        *refs += 1;
        if *refs == 1
            && let Err(e) = self.post("acquire")
        {
            log::warn!("power manager acquire failed: {e:#}");
        }
    }

    fn release(&self) {
        let mut refs = self.refs.lock().unwrap();
        if *refs == 0 {
            log::warn!("power manager release without a matching acquire");
            return;
        }
        *refs -= 1;
        if *refs == 0
            && let Err(e) = self.post("release")
        {
            log::warn!("power manager release failed: {e:#}");
        }
    }
}
