//! Server-local half of cluster-wide artifact deletion.
//!
//! An operator retires an artifact by marking it DELETED in the store. Each
//! server removes its own copy and acknowledges; once every known server has
//! acknowledged, the store moves the record to MARKED_FOR_PURGE.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::Result;
use crate::cache::FingerprintCache;
use crate::store::ArtifactStore;
use crate::sync::expected_path;
use crate::types::{ArtifactKey, DeploymentClass};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub deleted_files: Vec<PathBuf>,
    /// Keys of the DELETED records seen this cycle.
    pub retired: Vec<ArtifactKey>,
    /// Every retired record was acknowledged.
    pub acknowledged: bool,
    /// Records that became purgeable through this acknowledgement.
    pub purgeable: usize,
}

pub struct ClusterDeletionCoordinator {
    class: DeploymentClass,
    store: Arc<dyn ArtifactStore>,
    server_id: String,
}

impl ClusterDeletionCoordinator {
    pub fn new(class: DeploymentClass, store: Arc<dyn ArtifactStore>, server_id: impl Into<String>) -> Self {
        Self {
            class,
            store,
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// DELETED keys this server has not acknowledged yet.
    pub fn pending_acknowledgements(&self) -> Result<HashSet<ArtifactKey>> {
        Ok(self
            .store
            .pending_acknowledgements(self.class, &self.server_id)?
            .into_iter()
            .collect())
    }

    /// Delete local copies of retired artifacts, then acknowledge them.
    ///
    /// Only the records listed here are acknowledged, and a record whose file
    /// could not be removed is left out, so it cannot be purged while a copy
    /// still exists here.
    pub fn delete_local(&self, dir: &Path, cache: &mut FingerprintCache) -> Result<DeletionReport> {
        let mut report = DeletionReport::default();
        let mut handled = Vec::new();

        for record in self.store.list_deleted(self.class)? {
            let key = record.key();
            let mut targets: Vec<PathBuf> = cache
                .entries()
                .filter(|(_, e)| e.key() == key)
                .map(|(p, _)| p.to_path_buf())
                .collect();
            if let Ok(path) = expected_path(dir, &record) {
                let foreign = cache.get(&path).is_some_and(|e| e.key() != key);
                if !foreign && !targets.contains(&path) && path.exists() {
                    targets.push(path);
                }
            }

            let mut removed = true;
            for path in targets {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        info!("Deleted retired {} artifact {} at {}", self.class, key, path.display());
                        cache.remove(&path);
                        report.deleted_files.push(path);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        cache.remove(&path);
                    }
                    Err(e) => {
                        warn!("Could not delete retired {}: {}", path.display(), e);
                        removed = false;
                    }
                }
            }
            if removed {
                handled.push(key.clone());
            } else {
                debug!("Withholding acknowledgement of {} for {}", key, self.server_id);
            }
            report.retired.push(key);
        }

        report.purgeable = self
            .store
            .acknowledge_deleted_by(self.class, &self.server_id, &handled)?;
        report.acknowledged = handled.len() == report.retired.len();
        if report.purgeable > 0 {
            info!(
                "{} {} artifact(s) now ready for purge",
                report.purgeable, self.class
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::fs::hash_bytes;
    use crate::store::{ContentUpdate, MemoryStore};
    use crate::types::ArtifactStatus;
    use tempfile::TempDir;

    const CLASS: DeploymentClass = DeploymentClass::Agent;

    fn publish(store: &MemoryStore, dir: &Path, name: &str) {
        let source = dir.join(format!("{name}.staged"));
        std::fs::write(&source, name).expect("write should succeed");
        store
            .update_content(
                CLASS,
                &ArtifactKey::new(name),
                ContentUpdate {
                    path: format!("{name}.jar"),
                    version: None,
                    mtime: 1,
                    content_hash: hash_bytes(name.as_bytes()),
                    source,
                },
            )
            .expect("publish should succeed");
    }

    fn cache_file(cache: &mut FingerprintCache, path: &Path, name: &str) {
        std::fs::write(path, name).expect("write should succeed");
        cache.put(
            path,
            CacheEntry {
                name: name.to_string(),
                type_tag: None,
                content_hash: hash_bytes(name.as_bytes()),
                version: None,
                mtime: 1,
            },
        );
    }

    #[test]
    fn test_deletes_by_key_and_path_then_acknowledges() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let dir = tmp.path().join("plugins");
        std::fs::create_dir_all(&dir).expect("mkdir should succeed");
        let store = MemoryStore::new();
        store.register_server("s1").expect("register should succeed");
        publish(&store, tmp.path(), "old");
        publish(&store, tmp.path(), "keep");
        store
            .mark_deleted(CLASS, &ArtifactKey::new("old"))
            .expect("delete should succeed");

        let mut cache = FingerprintCache::new();
        cache_file(&mut cache, &dir.join("renamed-old.jar"), "old");
        cache_file(&mut cache, &dir.join("keep.jar"), "keep");
        std::fs::write(dir.join("old.jar"), b"uncached copy").expect("write should succeed");

        let coordinator = ClusterDeletionCoordinator::new(CLASS, Arc::new(store.clone()), "s1");
        assert_eq!(
            coordinator.pending_acknowledgements().expect("list should succeed").len(),
            1
        );
        let report = coordinator
            .delete_local(&dir, &mut cache)
            .expect("deletion pass should succeed");

        assert_eq!(report.deleted_files.len(), 2);
        assert!(!dir.join("renamed-old.jar").exists());
        assert!(!dir.join("old.jar").exists());
        assert!(dir.join("keep.jar").exists());
        assert_eq!(cache.len(), 1);
        assert!(report.acknowledged);
        assert_eq!(report.purgeable, 1);
        assert_eq!(
            store.record(CLASS, &ArtifactKey::new("old")).map(|r| r.status),
            Some(ArtifactStatus::MarkedForPurge)
        );
        assert!(
            coordinator
                .pending_acknowledgements()
                .expect("list should succeed")
                .is_empty()
        );
    }

    #[test]
    fn test_acknowledgement_is_idempotent_with_nothing_to_delete() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let store = MemoryStore::new();
        let coordinator = ClusterDeletionCoordinator::new(CLASS, Arc::new(store), "s1");
        let mut cache = FingerprintCache::new();

        for _ in 0..2 {
            let report = coordinator
                .delete_local(tmp.path(), &mut cache)
                .expect("deletion pass should succeed");
            assert!(report.acknowledged);
            assert!(report.deleted_files.is_empty());
        }
    }

    #[test]
    fn test_undeletable_copy_withholds_only_its_own_acknowledgement() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let dir = tmp.path().join("plugins");
        let store = MemoryStore::new();
        store.register_server("s1").expect("register should succeed");
        publish(&store, tmp.path(), "gone");
        publish(&store, tmp.path(), "stuck");
        for name in ["gone", "stuck"] {
            store
                .mark_deleted(CLASS, &ArtifactKey::new(name))
                .expect("delete should succeed");
        }
        // A directory where the file should be cannot be removed as a file.
        std::fs::create_dir_all(dir.join("stuck.jar")).expect("mkdir should succeed");

        let coordinator = ClusterDeletionCoordinator::new(CLASS, Arc::new(store.clone()), "s1");
        let report = coordinator
            .delete_local(&dir, &mut FingerprintCache::new())
            .expect("deletion pass should succeed");

        assert!(!report.acknowledged);
        assert_eq!(report.purgeable, 1);
        assert_eq!(
            store.record(CLASS, &ArtifactKey::new("gone")).map(|r| r.status),
            Some(ArtifactStatus::MarkedForPurge)
        );
        assert_eq!(
            store.record(CLASS, &ArtifactKey::new("stuck")).map(|r| r.status),
            Some(ArtifactStatus::Deleted)
        );
        let pending = coordinator
            .pending_acknowledgements()
            .expect("list should succeed");
        assert_eq!(pending, HashSet::from([ArtifactKey::new("stuck")]));
    }

    #[test]
    fn test_purge_waits_for_every_server() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let store = MemoryStore::new();
        store.register_server("s1").expect("register should succeed");
        store.register_server("s2").expect("register should succeed");
        publish(&store, tmp.path(), "p");
        store
            .mark_deleted(CLASS, &ArtifactKey::new("p"))
            .expect("delete should succeed");

        let dir_a = tmp.path().join("a");
        let dir_b = tmp.path().join("b");
        std::fs::create_dir_all(&dir_a).expect("mkdir should succeed");
        std::fs::create_dir_all(&dir_b).expect("mkdir should succeed");

        let a = ClusterDeletionCoordinator::new(CLASS, Arc::new(store.clone()), "s1");
        let b = ClusterDeletionCoordinator::new(CLASS, Arc::new(store.clone()), "s2");

        a.delete_local(&dir_a, &mut FingerprintCache::new())
            .expect("deletion pass should succeed");
        assert_eq!(
            store.record(CLASS, &ArtifactKey::new("p")).map(|r| r.status),
            Some(ArtifactStatus::Deleted)
        );
        b.delete_local(&dir_b, &mut FingerprintCache::new())
            .expect("deletion pass should succeed");
        assert_eq!(
            store.record(CLASS, &ArtifactKey::new("p")).map(|r| r.status),
            Some(ArtifactStatus::MarkedForPurge)
        );
    }
}
