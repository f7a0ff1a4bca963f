//! Media-metadata probe: one duration lookup per regular file at index time.

use std::path::Path;
use std::process::Command;

pub trait DurationProbe: Send + Sync {
    /// Media duration of the file in whole seconds, or none when the file
    /// has no duration tag or the probe is unavailable.
    fn duration_secs(&self, path: &Path) -> Option<i64>;
}

/// Shells out to exiftool for the numeric Duration tag.
pub struct ExifToolProbe;

impl DurationProbe for ExifToolProbe {
    fn duration_secs(&self, path: &Path) -> Option<i64> {
        let output = Command::new("exiftool")
            .args(["-s3", "-n", "-Duration"])
            .arg(path)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let seconds: f64 = text.trim().parse().ok()?;
        Some(seconds as i64)
    }
}
