//! In-memory fingerprints of the files last seen in a deployment directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::ArtifactKey;
use crate::version::PluginVersion;

/// Fingerprint of one file: identity plus the change-detection triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub name: String,
    pub type_tag: Option<String>,
    pub content_hash: String,
    pub version: Option<String>,
    /// Milliseconds since the epoch, 0 when unknown.
    pub mtime: u64,
}

impl CacheEntry {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            name: self.name.clone(),
            type_tag: self.type_tag.clone(),
        }
    }

    pub fn plugin_version(&self) -> PluginVersion {
        PluginVersion::parse(self.version.as_deref())
    }
}

/// Path-keyed map of [`CacheEntry`] values.
///
/// Owned by exactly one deployer and mutated only from its scan cycle, so
/// there is no interior locking. Iteration is ordered by path.
#[derive(Debug, Default, Clone)]
pub struct FingerprintCache {
    entries: BTreeMap<PathBuf, CacheEntry>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, path: impl Into<PathBuf>, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(path.into(), entry)
    }

    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        self.entries.remove(path)
    }

    /// Remove every entry matching `pred` and return what was removed.
    pub fn remove_if<F>(&mut self, mut pred: F) -> Vec<(PathBuf, CacheEntry)>
    where
        F: FnMut(&Path, &CacheEntry) -> bool,
    {
        let doomed: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(path, entry)| pred(path, entry))
            .map(|(path, _)| path.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|path| self.entries.remove(&path).map(|entry| (path, entry)))
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Path, &CacheEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_path(), e))
    }

    /// First entry (in path order) whose key matches.
    pub fn find_by_key(&self, key: &ArtifactKey) -> Option<(&Path, &CacheEntry)> {
        self.entries()
            .find(|(_, e)| e.name == key.name && e.type_tag == key.type_tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
