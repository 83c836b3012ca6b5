use std::path::Path;

use oxio_common::error::{OxioError, Result};

/// Slice of total capacity held back for journalling, inodes and friends.
const RESERVED_TOTAL_RATIO: f64 = 0.05;

/// Admission check for writes: free space as a percentage of the
/// non-reserved capacity must stay above `min_free_percent`.
pub fn check_free(root: &Path, min_free_percent: f64) -> Result<()> {
    let stat = rustix::fs::statvfs(root).map_err(|err| {
        OxioError::InternalError(format!("statvfs on {}: {err}", root.display()))
    })?;

    let total = (stat.f_blocks * stat.f_frsize) as f64;
    let free = (stat.f_bavail * stat.f_frsize) as f64;
    let free_percent = free / (total - RESERVED_TOTAL_RATIO * total) * 100.0;
    if free_percent <= min_free_percent {
        return Err(OxioError::RootPathFull(root.display().to_string()));
    }
    Ok(())
}
