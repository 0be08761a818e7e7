//! In-process store. Clones share the same state, which is how tests model
//! several servers talking to one database.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::state::StoreState;
use super::{ArtifactStore, ContentUpdate};
use crate::fs::hash_bytes;
use crate::types::{ArtifactKey, ArtifactRecord, DeploymentClass};
use crate::{Result, SyncError};

#[derive(Debug, Default)]
struct Inner {
    state: StoreState,
    /// Content blobs keyed by hash.
    blobs: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::store("memory", "store mutex poisoned"))
    }

    /// Insert a record as-is. `content` of `None` models a row whose blob was
    /// never stored.
    pub fn insert(&self, mut record: ArtifactRecord, content: Option<Vec<u8>>) -> Result<()> {
        let mut inner = self.lock()?;
        record.has_content = content.is_some();
        if let Some(bytes) = content {
            inner.blobs.insert(record.content_hash.clone(), bytes);
        }
        inner.state.insert(record);
        Ok(())
    }

    /// Snapshot of a single record.
    pub fn record(&self, class: DeploymentClass, key: &ArtifactKey) -> Option<ArtifactRecord> {
        self.lock()
            .ok()?
            .state
            .find(class, key)
            .map(|a| a.record.clone())
    }
}

impl ArtifactStore for MemoryStore {
    fn list_records(&self, class: DeploymentClass) -> Result<Vec<ArtifactRecord>> {
        Ok(self.lock()?.state.records(class))
    }

    fn read_content(
        &self,
        class: DeploymentClass,
        key: &ArtifactKey,
    ) -> Result<Box<dyn Read + Send>> {
        let inner = self.lock()?;
        let artifact = inner
            .state
            .find(class, key)
            .ok_or_else(|| SyncError::NotFound(format!("{class} artifact {key}")))?;
        let bytes = inner
            .blobs
            .get(&artifact.record.content_hash)
            .filter(|_| artifact.record.has_content)
            .ok_or_else(|| SyncError::NotFound(format!("content of {class} artifact {key}")))?;
        Ok(Box::new(Cursor::new(bytes.clone())))
    }

    fn update_content(
        &self,
        class: DeploymentClass,
        key: &ArtifactKey,
        update: ContentUpdate,
    ) -> Result<ArtifactRecord> {
        let bytes = std::fs::read(&update.source)?;
        let actual = hash_bytes(&bytes);
        if actual != update.content_hash {
            return Err(SyncError::store(
                &key.name,
                format!(
                    "content hash mismatch: expected {}, got {}",
                    update.content_hash, actual
                ),
            ));
        }

        let mut inner = self.lock()?;
        let record = inner.state.apply_update(class, key, &update)?;
        inner.blobs.insert(actual, bytes);
        debug!("Stored content for {} artifact {}", class, key);
        Ok(record)
    }

    fn mark_deleted(&self, class: DeploymentClass, key: &ArtifactKey) -> Result<()> {
        self.lock()?.state.mark_deleted(class, key)
    }

    fn acknowledge_deleted_by(
        &self,
        class: DeploymentClass,
        server_id: &str,
        keys: &[ArtifactKey],
    ) -> Result<usize> {
        Ok(self.lock()?.state.acknowledge(class, server_id, keys))
    }

    fn pending_acknowledgements(
        &self,
        class: DeploymentClass,
        server_id: &str,
    ) -> Result<Vec<ArtifactKey>> {
        Ok(self.lock()?.state.pending_acknowledgements(class, server_id))
    }

    fn set_enabled(&self, class: DeploymentClass, key: &ArtifactKey, enabled: bool) -> Result<()> {
        self.lock()?.state.set_enabled(class, key, enabled)
    }

    fn register_server(&self, server_id: &str) -> Result<()> {
        self.lock()?.state.servers.insert(server_id.to_string());
        Ok(())
    }
}
