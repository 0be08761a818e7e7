//! The canonical artifact store shared by every server in a cluster.
//!
//! Servers coordinate only through this store. Each operation is atomic per
//! record: a content update either changes content, hash, mtime, path and
//! version together or changes nothing.

pub mod file;
pub mod memory;
mod state;

use std::io::Read;
use std::path::PathBuf;

use crate::Result;
use crate::types::{ArtifactKey, ArtifactRecord, ArtifactStatus, DeploymentClass};

pub use file::FileStore;
pub use memory::MemoryStore;

/// New authoritative content for one artifact.
#[derive(Debug, Clone)]
pub struct ContentUpdate {
    /// File name the artifact should carry in deployment directories.
    pub path: String,
    pub version: Option<String>,
    pub mtime: u64,
    /// Expected hash of `source`; the update is rejected on mismatch.
    pub content_hash: String,
    /// Local file the content is streamed from.
    pub source: PathBuf,
}

pub trait ArtifactStore: Send + Sync {
    /// Every record of the class, whatever its status.
    fn list_records(&self, class: DeploymentClass) -> Result<Vec<ArtifactRecord>>;

    /// Stream the stored content of an artifact.
    fn read_content(&self, class: DeploymentClass, key: &ArtifactKey)
    -> Result<Box<dyn Read + Send>>;

    /// Atomically upsert content, hash, mtime, path and version.
    ///
    /// New records start enabled and installed. Records that are deleted or
    /// marked for purge are refused.
    fn update_content(
        &self,
        class: DeploymentClass,
        key: &ArtifactKey,
        update: ContentUpdate,
    ) -> Result<ArtifactRecord>;

    /// Retire an artifact. It stays DELETED until every server acknowledged.
    fn mark_deleted(&self, class: DeploymentClass, key: &ArtifactKey) -> Result<()>;

    /// Record that `server_id` removed its local copies of the DELETED
    /// artifacts in `keys`. Keys that are not DELETED are ignored.
    /// Idempotent. Returns how many records moved to MARKED_FOR_PURGE as a
    /// result.
    fn acknowledge_deleted_by(
        &self,
        class: DeploymentClass,
        server_id: &str,
        keys: &[ArtifactKey],
    ) -> Result<usize>;

    fn list_deleted(&self, class: DeploymentClass) -> Result<Vec<ArtifactRecord>> {
        Ok(self
            .list_records(class)?
            .into_iter()
            .filter(|r| r.status == ArtifactStatus::Deleted)
            .collect())
    }

    /// DELETED artifacts `server_id` has not acknowledged yet.
    fn pending_acknowledgements(
        &self,
        class: DeploymentClass,
        server_id: &str,
    ) -> Result<Vec<ArtifactKey>>;

    fn set_enabled(&self, class: DeploymentClass, key: &ArtifactKey, enabled: bool) -> Result<()>;

    fn disable(&self, class: DeploymentClass, key: &ArtifactKey) -> Result<()> {
        self.set_enabled(class, key, false)
    }

    /// Add a server to the set whose acknowledgements gate purging.
    fn register_server(&self, server_id: &str) -> Result<()>;
}
