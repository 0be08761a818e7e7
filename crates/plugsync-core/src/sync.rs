//! Reconciliation of the local directory against the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, FingerprintCache};
use crate::fs::{hash_file, mtime_millis, set_mtime_millis, write_atomic};
use crate::obsolescence::{Fingerprint, ObsolescenceResolver, Verdict};
use crate::store::{ArtifactStore, ContentUpdate};
use crate::types::{ArtifactKey, ArtifactRecord, DeploymentClass};
use crate::{Result, SyncError};

/// Sibling names tried before a pull onto a foreign file gives up.
const MAX_PULL_RENAMES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedArtifact {
    pub key: ArtifactKey,
    pub path: PathBuf,
    /// Whether the local content differs from what was registered before.
    pub content_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Store content written to disk.
    pub pulled: Vec<SyncedArtifact>,
    /// Local content streamed into records that had none.
    pub pushed: Vec<SyncedArtifact>,
    /// Local copy is newer than the store; the store must be updated from it.
    pub flagged_stale: Vec<SyncedArtifact>,
    /// Identical on both sides; only the mtime was synced.
    pub refreshed: Vec<ArtifactKey>,
    /// Records without content anywhere, disabled.
    pub disabled: Vec<ArtifactKey>,
    /// Records whose reconciliation failed this cycle.
    pub failed: Vec<ArtifactKey>,
}

impl ReconcileReport {
    /// Everything that needs (re)registration.
    pub fn changed(&self) -> impl Iterator<Item = &SyncedArtifact> {
        self.pulled
            .iter()
            .chain(self.flagged_stale.iter())
            .chain(self.pushed.iter().filter(|p| p.content_changed))
    }
}

pub struct StoreSynchronizer {
    class: DeploymentClass,
    store: Arc<dyn ArtifactStore>,
}

impl StoreSynchronizer {
    pub fn new(class: DeploymentClass, store: Arc<dyn ArtifactStore>) -> Self {
        Self { class, store }
    }

    /// Bring `dir` and `cache` in line with the active records of this
    /// class. Per-record failures are logged and reported; they never stop
    /// the remaining records.
    pub fn reconcile(
        &self,
        dir: &Path,
        records: &[ArtifactRecord],
        cache: &mut FingerprintCache,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for record in records
            .iter()
            .filter(|r| r.deployment_class == self.class && r.is_active())
        {
            let key = record.key();
            let outcome = if record.has_content {
                self.reconcile_one(dir, record, cache, &mut report)
            } else {
                self.backfill(dir, record, cache, &mut report)
            };
            if let Err(e) = outcome {
                warn!("Failed to reconcile {} artifact {}: {}", self.class, key, e);
                report.failed.push(key);
            }
        }

        report
    }

    fn reconcile_one(
        &self,
        dir: &Path,
        record: &ArtifactRecord,
        cache: &mut FingerprintCache,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let key = record.key();
        let expected = expected_path(dir, record)?;

        let Some((local_path, local)) = locate(cache, &expected, &key) else {
            debug!("{} artifact {} missing locally, pulling", self.class, key);
            let target = pull_target(&expected, record, cache)?;
            let path = self.pull(record, &target, cache)?;
            report.pulled.push(SyncedArtifact {
                key,
                path,
                content_changed: true,
            });
            return Ok(());
        };

        match ObsolescenceResolver::compare(&Fingerprint::from(&local), &Fingerprint::from(record))
        {
            Verdict::AObsolete => {
                info!(
                    "Local {} is older than the store copy of {}, replacing",
                    local_path.display(),
                    key
                );
                remove_local(&local_path, cache)?;
                let target = pull_target(&expected, record, cache)?;
                let path = self.pull(record, &target, cache)?;
                report.pulled.push(SyncedArtifact {
                    key,
                    path,
                    content_changed: true,
                });
            }
            Verdict::BObsolete => {
                info!(
                    "Store copy of {} is older than {}, flagging for update",
                    key,
                    local_path.display()
                );
                report.flagged_stale.push(SyncedArtifact {
                    key,
                    path: local_path,
                    content_changed: true,
                });
            }
            Verdict::Identical => {
                if record.mtime != 0 && local.mtime != record.mtime {
                    set_mtime_millis(&local_path, record.mtime)?;
                    cache.put(
                        local_path,
                        CacheEntry {
                            mtime: record.mtime,
                            ..local
                        },
                    );
                    debug!("Synced mtime of {} with the store", key);
                }
                report.refreshed.push(key);
            }
        }
        Ok(())
    }

    /// Write the record's content to `target` and cache it.
    fn pull(
        &self,
        record: &ArtifactRecord,
        target: &Path,
        cache: &mut FingerprintCache,
    ) -> Result<PathBuf> {
        let key = record.key();
        let content = self.store.read_content(self.class, &key)?;
        write_atomic(target, content, record.mtime)?;

        let content_hash = hash_file(target)?;
        if content_hash != record.content_hash {
            warn!(
                "Pulled content of {} hashes to {}, store says {}",
                key, content_hash, record.content_hash
            );
        }
        cache.put(
            target,
            CacheEntry {
                name: record.name.clone(),
                type_tag: record.type_tag.clone(),
                content_hash,
                version: record.version.clone(),
                mtime: mtime_millis(target),
            },
        );
        info!("Pulled {} artifact {} to {}", self.class, key, target.display());
        Ok(target.to_path_buf())
    }

    /// One-time migration of records whose content was never stored.
    fn backfill(
        &self,
        dir: &Path,
        record: &ArtifactRecord,
        cache: &mut FingerprintCache,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let key = record.key();
        let expected = expected_path(dir, record)?;

        let Some((local_path, local)) = locate(cache, &expected, &key) else {
            warn!(
                "{} artifact {} has no content in the store and no local file, disabling",
                self.class, key
            );
            self.store.disable(self.class, &key)?;
            report.disabled.push(key);
            return Ok(());
        };

        let file_name = file_name_of(&local_path)?;
        self.store.update_content(
            self.class,
            &key,
            ContentUpdate {
                path: file_name,
                version: local.version.clone(),
                mtime: local.mtime,
                content_hash: local.content_hash.clone(),
                source: local_path.clone(),
            },
        )?;
        info!("Backfilled store content of {} from {}", key, local_path.display());
        report.pushed.push(SyncedArtifact {
            key,
            path: local_path,
            content_changed: local.content_hash != record.content_hash,
        });
        Ok(())
    }
}

/// Cache entry at the record's path if it belongs to the same key, else the
/// first entry with that key anywhere.
fn locate(
    cache: &FingerprintCache,
    expected: &Path,
    key: &ArtifactKey,
) -> Option<(PathBuf, CacheEntry)> {
    if let Some(entry) = cache.get(expected) {
        if entry.key() == *key {
            return Some((expected.to_path_buf(), entry.clone()));
        }
    }
    cache
        .find_by_key(key)
        .map(|(path, entry)| (path.to_path_buf(), entry.clone()))
}

/// Where to write a pulled record. The record's own path unless that file
/// belongs to another artifact, in which case a free sibling name is used.
fn pull_target(
    expected: &Path,
    record: &ArtifactRecord,
    cache: &FingerprintCache,
) -> Result<PathBuf> {
    let key = record.key();
    let occupied = |path: &Path| match cache.get(path) {
        Some(entry) => entry.key() != key,
        None => path.exists(),
    };
    if !occupied(expected) {
        return Ok(expected.to_path_buf());
    }

    let stem = expected
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(record.name.as_str());
    let extension = expected
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let suffix = record
        .type_tag
        .as_deref()
        .or(record.version.as_deref())
        .unwrap_or(record.name.as_str());

    for n in 1..=MAX_PULL_RENAMES {
        let file = if n == 1 {
            format!("{stem}-{suffix}{extension}")
        } else {
            format!("{stem}-{suffix}-{n}{extension}")
        };
        let candidate = expected.with_file_name(file);
        if !occupied(&candidate) {
            warn!(
                "{} belongs to another artifact, pulling {} to {} instead",
                expected.display(),
                key,
                candidate.display()
            );
            return Ok(candidate);
        }
    }
    Err(SyncError::store(
        &record.name,
        format!("no free file name next to {}", expected.display()),
    ))
}

fn remove_local(path: &Path, cache: &mut FingerprintCache) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    cache.remove(path);
    Ok(())
}

/// The record's path, confined to `dir`.
pub(crate) fn expected_path(dir: &Path, record: &ArtifactRecord) -> Result<PathBuf> {
    Path::new(&record.path)
        .file_name()
        .map(|name| dir.join(name))
        .ok_or_else(|| SyncError::store(&record.name, format!("invalid path '{}'", record.path)))
}

pub(crate) fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| SyncError::corrupt(path, "file name is not valid UTF-8"))
}
