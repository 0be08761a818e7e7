//! Directory-backed store usable by several processes on one host or a
//! shared mount.
//!
//! Layout under the store root:
//! - `index.json`: every record plus server and acknowledgement sets
//! - `blobs/<hash>`: content-addressed artifact content
//! - `.lock`: held for the duration of each operation
//!
//! Blobs are written before the index references them and the index is
//! replaced with tmp + rename, so a crash leaves at worst an unreferenced
//! blob behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::state::StoreState;
use super::{ArtifactStore, ContentUpdate};
use crate::fs::write_atomic;
use crate::types::{ArtifactKey, ArtifactRecord, DeploymentClass};
use crate::{Result, SyncError};

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const LOCK_FILE: &str = ".lock";
const LOCK_ATTEMPTS: u32 = 120;
const LOCK_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

/// Exclusive hold on the store directory, released on drop.
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        for attempt in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Owner pid is informational only.
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt > 0 && attempt % 40 == 0 {
                        debug!("Waiting for store lock {}", path.display());
                    }
                    thread::sleep(LOCK_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SyncError::transient(&path, "store lock is held by another process"))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release store lock {}: {}", self.path.display(), e);
        }
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOB_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(BLOB_DIR).join(hash)
    }

    fn load(&self) -> Result<StoreState> {
        let path = self.root.join(INDEX_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &StoreState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.root.join(INDEX_FILE), bytes.as_slice(), 0)
    }

    /// Run `f` against the index under the lock, saving if it succeeds.
    fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreState) -> Result<T>,
    {
        let _lock = StoreLock::acquire(&self.root)?;
        let mut state = self.load()?;
        let out = f(&mut state)?;
        self.save(&state)?;
        Ok(out)
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StoreState) -> T,
    {
        let _lock = StoreLock::acquire(&self.root)?;
        Ok(f(&self.load()?))
    }

    /// Stream `source` into the blob directory, verifying the hash on the way.
    fn write_blob(&self, source: &Path, expected: &str, name: &str) -> Result<()> {
        let target = self.blob_path(expected);
        if target.exists() {
            return Ok(());
        }

        let mut input = File::open(source)?;
        let mut tmp = NamedTempFile::new_in(self.root.join(BLOB_DIR))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }

        let actual = hasher.finalize().to_hex().to_string();
        if actual != expected {
            return Err(SyncError::store(
                name,
                format!("content hash mismatch: expected {expected}, got {actual}"),
            ));
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| SyncError::from(e.error))?;
        Ok(())
    }

    /// Insert a record as-is, optionally with its content.
    pub fn insert(&self, mut record: ArtifactRecord, content: Option<&[u8]>) -> Result<()> {
        record.has_content = content.is_some();
        if let Some(bytes) = content {
            write_atomic(&self.blob_path(&record.content_hash), bytes, 0)?;
        }
        self.modify(|state| {
            state.insert(record);
            Ok(())
        })
    }
}

impl ArtifactStore for FileStore {
    fn list_records(&self, class: DeploymentClass) -> Result<Vec<ArtifactRecord>> {
        self.read(|state| state.records(class))
    }

    fn read_content(
        &self,
        class: DeploymentClass,
        key: &ArtifactKey,
    ) -> Result<Box<dyn Read + Send>> {
        let record = self
            .read(|state| state.find(class, key).map(|a| a.record.clone()))?
            .ok_or_else(|| SyncError::NotFound(format!("{class} artifact {key}")))?;
        if !record.has_content {
            return Err(SyncError::NotFound(format!(
                "content of {class} artifact {key}"
            )));
        }
        let file = File::open(self.blob_path(&record.content_hash))?;
        Ok(Box::new(file))
    }

    fn update_content(
        &self,
        class: DeploymentClass,
        key: &ArtifactKey,
        update: ContentUpdate,
    ) -> Result<ArtifactRecord> {
        self.write_blob(&update.source, &update.content_hash, &key.name)?;
        let record = self.modify(|state| state.apply_update(class, key, &update))?;
        debug!("Stored content for {} artifact {}", class, key);
        Ok(record)
    }

    fn mark_deleted(&self, class: DeploymentClass, key: &ArtifactKey) -> Result<()> {
        self.modify(|state| state.mark_deleted(class, key))
    }

    fn acknowledge_deleted_by(
        &self,
        class: DeploymentClass,
        server_id: &str,
        keys: &[ArtifactKey],
    ) -> Result<usize> {
        self.modify(|state| Ok(state.acknowledge(class, server_id, keys)))
    }

    fn pending_acknowledgements(
        &self,
        class: DeploymentClass,
        server_id: &str,
    ) -> Result<Vec<ArtifactKey>> {
        self.read(|state| state.pending_acknowledgements(class, server_id))
    }

    fn set_enabled(&self, class: DeploymentClass, key: &ArtifactKey, enabled: bool) -> Result<()> {
        self.modify(|state| state.set_enabled(class, key, enabled))
    }

    fn register_server(&self, server_id: &str) -> Result<()> {
        self.modify(|state| {
            state.servers.insert(server_id.to_string());
            Ok(())
        })
    }
}
