use serde::Serialize;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// One recording on disk, as reported to bus clients
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordingEntry {
    pub filename: String,
    pub path: String,
    pub size: u64,
    /// Last modification time as unix seconds
    pub date: u64,
    /// Worker internal id extracted from the filename
    pub internalid: String,
}

/// List `.avi` recordings under `dir` whose filename starts with `prefix`
/// (`timelapse_` or `motion_`).
pub fn list_recordings(dir: &Path, prefix: &str) -> Vec<RecordingEntry> {
    let mut entries = Vec::new();
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return entries;
    };

    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !filename.starts_with(prefix) || !filename.ends_with(".avi") {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let date = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        // <kind>_<internalid>_<stamp>.avi
        let internalid = filename.split('_').nth(1).unwrap_or("").to_string();

        entries.push(RecordingEntry {
            filename: filename.to_string(),
            path: path.to_string_lossy().to_string(),
            size: metadata.len(),
            date,
            internalid,
        });
    }

    entries.sort_by(|a, b| a.filename.cmp(&b.filename));
    debug!("Found {} '{}' recordings in {}", entries.len(), prefix, dir.display());
    entries
}

/// Delete recordings with the given prefix older than `lifetime_days`.
/// Returns the number of files removed. A lifetime of zero disables purging.
pub fn purge_expired(dir: &Path, prefix: &str, lifetime_days: u32) -> usize {
    if lifetime_days == 0 {
        return 0;
    }
    let cutoff = SystemTime::now() - Duration::from_secs(lifetime_days as u64 * 86_400);
    let mut removed = 0;

    for entry in list_recordings(dir, prefix) {
        let expired = UNIX_EPOCH + Duration::from_secs(entry.date) < cutoff;
        if !expired {
            continue;
        }
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                info!("Purged expired recording {}", entry.filename);
                removed += 1;
            }
            Err(e) => warn!("Failed to purge {}: {}", entry.filename, e),
        }
    }
    removed
}
