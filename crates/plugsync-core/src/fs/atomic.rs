//! Atomic file replacement.

use std::io::{self, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use super::mtime::set_mtime_millis;

/// Stream `content` into `target` through a temp file in the same directory,
/// stamp it with `mtime` (when non-zero) and rename it into place.
///
/// Readers never observe a partially written file, and two writers racing on
/// the same target with the same bytes both succeed.
pub fn write_atomic(target: &Path, mut content: impl Read, mtime: u64) -> crate::Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    io::copy(&mut content, tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.as_file().sync_all()?;
    set_mtime_millis(tmp.path(), mtime)?;

    tmp.persist(target).map_err(|e| crate::SyncError::from(e.error))?;
    Ok(())
}
