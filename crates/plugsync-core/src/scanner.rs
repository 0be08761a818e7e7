//! Directory walk, change detection and duplicate reduction.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, FingerprintCache};
use crate::descriptor::{Descriptor, DescriptorParser, is_bare_descriptor, wrap_bare_descriptor};
use crate::fs::{hash_file, mtime_millis};
use crate::obsolescence::{Fingerprint, ObsolescenceResolver, Verdict};
use crate::types::ArtifactKey;
use crate::{Result, SyncError};

/// Bounded retry for files that are still being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn run<T, F>(&self, path: &Path, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(
                        "Attempt {}/{} on {} failed: {}",
                        attempt,
                        attempts,
                        path.display(),
                        e
                    );
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A file whose identity was (re)read during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedArtifact {
    pub path: PathBuf,
    pub descriptor: Descriptor,
    pub content_hash: String,
    pub mtime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedArtifact {
    pub path: PathBuf,
    pub key: ArtifactKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<ScannedArtifact>,
    pub updated: Vec<ScannedArtifact>,
    /// Vanished files whose key has a cluster deletion pending.
    pub removed_obsolete: Vec<RemovedArtifact>,
    /// Losing duplicates deleted from disk this cycle.
    pub duplicates_removed: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed_obsolete.is_empty()
    }

    /// Added and updated artifacts together.
    pub fn changed(&self) -> impl Iterator<Item = &ScannedArtifact> {
        self.added.iter().chain(self.updated.iter())
    }
}

pub struct FilesystemScanner {
    parser: Arc<dyn DescriptorParser>,
    extensions: Vec<String>,
    retry: RetryPolicy,
}

impl FilesystemScanner {
    pub fn new(parser: Arc<dyn DescriptorParser>) -> Self {
        Self {
            parser,
            extensions: vec!["jar".to_string()],
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn parser(&self) -> &Arc<dyn DescriptorParser> {
        &self.parser
    }

    fn is_eligible(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
    }

    /// Scan `dir`, update `cache` in place and report what changed.
    ///
    /// Files that keep failing are skipped for this cycle; their cache
    /// entries stay as they were. Only a directory that cannot be listed
    /// fails the scan.
    pub fn scan_directory(
        &self,
        dir: &Path,
        cache: &mut FingerprintCache,
        pending_deletions: &HashSet<ArtifactKey>,
    ) -> Result<ChangeSet> {
        let mut changes = ChangeSet::default();
        let on_disk = self.walk(dir)?;

        let seen: HashSet<&Path> = on_disk.iter().map(PathBuf::as_path).collect();
        for (path, entry) in cache.remove_if(|path, _| !seen.contains(path)) {
            let key = entry.key();
            if pending_deletions.contains(&key) {
                debug!("{} removed for pending deletion of {}", path.display(), key);
                changes.removed_obsolete.push(RemovedArtifact { path, key });
            } else {
                debug!("{} vanished from disk", path.display());
            }
        }

        for path in &on_disk {
            match self.examine(path, cache) {
                Ok(Some(Examined::Added(scanned))) => changes.added.push(scanned),
                Ok(Some(Examined::Updated(scanned))) => changes.updated.push(scanned),
                Ok(None) => {}
                Err(e) => warn!("Skipping {} this cycle: {}", path.display(), e),
            }
        }

        changes.duplicates_removed = self.reduce_duplicates(cache);
        if !changes.duplicates_removed.is_empty() {
            let gone: HashSet<&PathBuf> = changes.duplicates_removed.iter().collect();
            changes.added.retain(|a| !gone.contains(&a.path));
            changes.updated.retain(|a| !gone.contains(&a.path));
        }

        Ok(changes)
    }

    /// Eligible regular files, sorted by path. Bare descriptors are wrapped
    /// first.
    fn walk(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            match entry.file_type() {
                Ok(ty) if ty.is_file() => {}
                _ => continue,
            }

            if is_bare_descriptor(&path) {
                match wrap_bare_descriptor(&path) {
                    Ok(wrapped) => files.push(wrapped),
                    Err(e) => warn!("Could not wrap {}: {}", path.display(), e),
                }
            } else if self.is_eligible(&path) {
                files.push(path);
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn examine(&self, path: &Path, cache: &mut FingerprintCache) -> Result<Option<Examined>> {
        let mtime = mtime_millis(path);

        let Some(cached) = cache.get(path).cloned() else {
            let scanned = self.fingerprint(path, mtime)?;
            cache.put(path, entry_for(&scanned));
            debug!("New artifact {} at {}", scanned.descriptor.key(), path.display());
            return Ok(Some(Examined::Added(scanned)));
        };

        if mtime != 0 && cached.mtime == mtime {
            return Ok(None);
        }

        let hash = self.retry.run(path, || hash_file(path))?;
        if hash == cached.content_hash {
            cache.put(
                path,
                CacheEntry {
                    mtime,
                    ..cached
                },
            );
            return Ok(None);
        }

        let descriptor = self.retry.run(path, || self.parser.parse(path))?;
        let scanned = ScannedArtifact {
            path: path.to_path_buf(),
            descriptor,
            content_hash: hash,
            mtime,
        };
        cache.put(path, entry_for(&scanned));
        info!("Artifact {} changed at {}", scanned.descriptor.key(), path.display());
        Ok(Some(Examined::Updated(scanned)))
    }

    fn fingerprint(&self, path: &Path, mtime: u64) -> Result<ScannedArtifact> {
        self.retry.run(path, || {
            let content_hash = hash_file(path)?;
            let descriptor = self.parser.parse(path)?;
            Ok(ScannedArtifact {
                path: path.to_path_buf(),
                descriptor,
                content_hash,
                mtime,
            })
        })
    }

    /// Keep one file per key; delete the rest.
    fn reduce_duplicates(&self, cache: &mut FingerprintCache) -> Vec<PathBuf> {
        let mut groups: BTreeMap<ArtifactKey, Vec<(PathBuf, Fingerprint)>> = BTreeMap::new();
        for (path, entry) in cache.entries() {
            groups
                .entry(entry.key())
                .or_default()
                .push((path.to_path_buf(), Fingerprint::from(entry)));
        }

        let mut removed = Vec::new();
        for (key, members) in groups.into_iter().filter(|(_, m)| m.len() > 1) {
            let mut members = members.into_iter();
            let Some(mut survivor) = members.next() else {
                continue;
            };
            let mut losers = Vec::new();
            for candidate in members {
                // Paths arrive sorted, so on a tie the survivor is the
                // lexicographically first path.
                match ObsolescenceResolver::compare(&survivor.1, &candidate.1) {
                    Verdict::AObsolete => losers.push(std::mem::replace(&mut survivor, candidate)),
                    Verdict::BObsolete | Verdict::Identical => losers.push(candidate),
                }
            }

            for (path, _) in losers {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        info!(
                            "Removed obsolete duplicate {} of {} (keeping {})",
                            path.display(),
                            key,
                            survivor.0.display()
                        );
                        cache.remove(&path);
                        removed.push(path);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        cache.remove(&path);
                        removed.push(path);
                    }
                    Err(e) => warn!(
                        "Could not delete obsolete duplicate {}: {}",
                        path.display(),
                        SyncError::from(e)
                    ),
                }
            }
        }
        removed
    }
}

enum Examined {
    Added(ScannedArtifact),
    Updated(ScannedArtifact),
}

fn entry_for(scanned: &ScannedArtifact) -> CacheEntry {
    CacheEntry {
        name: scanned.descriptor.name.clone(),
        type_tag: scanned.descriptor.type_tag.clone(),
        content_hash: scanned.content_hash.clone(),
        version: scanned.descriptor.version.clone(),
        mtime: scanned.mtime,
    }
}
