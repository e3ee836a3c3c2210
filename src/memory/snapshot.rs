use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SNAPSHOT_PREFIX: &str = "memsnap";

/// Diagnostic snapshot written to disk under critical memory pressure for
/// offline analysis. The only durable artifact the governor produces.
#[derive(Debug, Serialize)]
pub struct MemorySnapshot {
    pub captured_at: String,
    pub trigger: String,
    pub rss_mb: u64,
    pub virtual_mb: u64,
    pub usage_pct: f64,
    /// Tail of the sample history, oldest first.
    pub recent_rss_mb: Vec<u64>,
    pub leak_detected: bool,
    pub growth_rate_mb_per_min: f64,
}

/// Write a snapshot into `dir`, then prune the oldest snapshots beyond
/// `max_retained`. The filename encodes timestamp and trigger reason.
pub fn write_snapshot(dir: &Path, snapshot: &MemorySnapshot, max_retained: usize) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let trigger = sanitize(&snapshot.trigger);
    let path = dir.join(format!("{}-{}-{}.json", SNAPSHOT_PREFIX, stamp, trigger));

    let payload =
        serde_json::to_string_pretty(snapshot).context("Failed to serialize memory snapshot")?;
    std::fs::write(&path, payload)
        .with_context(|| format!("Failed to write snapshot {:?}", path))?;
    info!("Captured memory snapshot at {:?}", path);

    prune_snapshots(dir, max_retained);
    Ok(path)
}

/// Delete oldest snapshots until at most `max_retained` remain. Lexicographic
/// order matches chronological order because filenames start with the stamp.
fn prune_snapshots(dir: &Path, max_retained: usize) {
    let mut snapshots: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(SNAPSHOT_PREFIX))
                    .unwrap_or(false)
            })
            .collect(),
        Err(e) => {
            warn!("Failed to list snapshot directory {:?}: {}", dir, e);
            return;
        }
    };

    if snapshots.len() <= max_retained {
        return;
    }
    snapshots.sort();
    let excess = snapshots.len() - max_retained;
    for path in snapshots.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Failed to prune old snapshot {:?}: {}", path, e);
        }
    }
}

fn sanitize(trigger: &str) -> String {
    trigger
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
