//! Wrapping of bare descriptor files into artifact archives.
//!
//! Operators sometimes drop a `<name>-plugin.toml` straight into the
//! deployment directory. Such a file is packed into
//! `__from-bare__-<file>.jar`, the archive takes over the descriptor's
//! mtime, and the bare file is removed.

use std::path::{Path, PathBuf};

use tracing::info;

use super::Descriptor;
use super::archive::pack_raw;
use crate::fs::{mtime_millis, write_atomic};
use crate::{Result, SyncError};

pub const BARE_SUFFIX: &str = "-plugin.toml";
pub const WRAPPED_PREFIX: &str = "__from-bare__-";

pub fn is_bare_descriptor(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(BARE_SUFFIX) && n.len() > BARE_SUFFIX.len())
}

/// Wrap a bare descriptor and return the path of the new archive.
///
/// The descriptor is validated before anything is written; an invalid file
/// is left in place and reported as corrupt.
pub fn wrap_bare_descriptor(path: &Path) -> Result<PathBuf> {
    let content = std::fs::read_to_string(path)?;
    Descriptor::from_toml(&content).map_err(|e| SyncError::corrupt(path, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SyncError::corrupt(path, "file name is not valid UTF-8"))?;
    let target = path.with_file_name(format!("{WRAPPED_PREFIX}{file_name}.jar"));

    let bytes = pack_raw(&content, &[])?;
    write_atomic(&target, bytes.as_slice(), mtime_millis(path))?;
    std::fs::remove_file(path)?;

    info!(
        "Wrapped bare descriptor {} into {}",
        path.display(),
        target.display()
    );
    Ok(target)
}
