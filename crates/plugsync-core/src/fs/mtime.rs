//! Millisecond modification times.
//!
//! 0 is the sentinel for "unknown" everywhere in the crate.

use std::path::Path;
use std::time::UNIX_EPOCH;

use filetime::FileTime;

/// Modification time in milliseconds since the epoch, or 0 when it cannot be
/// read.
pub fn mtime_millis(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Set both access and modification time. A value of 0 is ignored.
pub fn set_mtime_millis(path: &Path, millis: u64) -> crate::Result<()> {
    if millis == 0 {
        return Ok(());
    }
    let secs = (millis / 1000) as i64;
    let nanos = ((millis % 1000) * 1_000_000) as u32;
    let time = FileTime::from_unix_time(secs, nanos);
    filetime::set_file_times(path, time, time)?;
    Ok(())
}
