//! Content fingerprints for artifact files.
//!
//! A fingerprint is the lowercase blake3 hex digest of the raw file bytes.
//! File names and metadata never contribute, so two copies of the same
//! archive under different names hash identically.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// Stream a file through blake3 and return the hex digest.
///
/// Zero-length files are rejected with a transient error: they are almost
/// always a copy that has not started writing yet.
pub fn hash_file(path: &Path) -> crate::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(crate::SyncError::transient(path, "file is empty"));
    }

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
