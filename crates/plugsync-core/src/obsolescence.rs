//! Deciding which of two copies of the same artifact is superseded.

use std::cmp::Ordering;

use crate::cache::CacheEntry;
use crate::types::ArtifactRecord;
use crate::version::PluginVersion;

/// Owned snapshot of the fields that decide obsolescence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub version: Option<String>,
    pub content_hash: String,
    pub mtime: u64,
}

impl From<&CacheEntry> for Fingerprint {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            version: entry.version.clone(),
            content_hash: entry.content_hash.clone(),
            mtime: entry.mtime,
        }
    }
}

impl From<&ArtifactRecord> for Fingerprint {
    fn from(record: &ArtifactRecord) -> Self {
        Self {
            version: record.version.clone(),
            content_hash: record.content_hash.clone(),
            mtime: record.mtime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    AObsolete,
    BObsolete,
    Identical,
}

impl Verdict {
    pub fn reverse(self) -> Self {
        match self {
            Verdict::AObsolete => Verdict::BObsolete,
            Verdict::BObsolete => Verdict::AObsolete,
            Verdict::Identical => Verdict::Identical,
        }
    }
}

pub struct ObsolescenceResolver;

impl ObsolescenceResolver {
    /// Compare two copies of one artifact.
    ///
    /// The lower version is obsolete regardless of content. Equal versions
    /// with equal hashes are identical. Equal versions with different
    /// content keep the lexicographically larger hash. The result depends
    /// only on (version, hash), so it orders any number of copies
    /// consistently and never depends on argument order.
    pub fn compare(a: &Fingerprint, b: &Fingerprint) -> Verdict {
        let va = PluginVersion::parse(a.version.as_deref());
        let vb = PluginVersion::parse(b.version.as_deref());

        let ordering = va
            .cmp(&vb)
            .then_with(|| a.content_hash.cmp(&b.content_hash));

        match ordering {
            Ordering::Less => Verdict::AObsolete,
            Ordering::Greater => Verdict::BObsolete,
            Ordering::Equal => Verdict::Identical,
        }
    }
}
