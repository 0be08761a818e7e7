//! One deployment class end to end: scan, reconcile, register.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::Result;
use crate::cache::FingerprintCache;
use crate::deletion::{ClusterDeletionCoordinator, DeletionReport};
use crate::descriptor::DescriptorParser;
use crate::registration::{
    BatchReport, Deployable, FacetReloader, IdentityProvider, Registrar,
    RegistrationOrchestrator,
};
use crate::scanner::{ChangeSet, FilesystemScanner, RetryPolicy};
use crate::store::ArtifactStore;
use crate::sync::{ReconcileReport, StoreSynchronizer};
use crate::types::{ArtifactKey, ArtifactRecord, DeploymentClass};

pub const DEFAULT_SCAN_PERIOD: Duration = Duration::from_secs(300);

/// External services a deployer talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ArtifactStore>,
    pub parser: Arc<dyn DescriptorParser>,
    pub registrar: Arc<dyn Registrar>,
    pub reloader: Arc<dyn FacetReloader>,
    pub identity: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub changes: ChangeSet,
    pub deletion: DeletionReport,
    pub reconcile: ReconcileReport,
    /// Artifacts waiting for registration after this scan.
    pub pending: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub scan: ScanOutcome,
    pub batch: BatchReport,
}

/// Work run once per scheduler tick.
pub trait ScanCycle: Send + 'static {
    fn run_cycle(&mut self) -> Result<CycleReport>;
    fn scan_period(&self) -> Duration;
    fn set_scan_period(&mut self, period: Duration);
}

pub struct PluginDeployer {
    class: DeploymentClass,
    plugin_dir: PathBuf,
    scan_period: Duration,
    store: Arc<dyn ArtifactStore>,
    scanner: FilesystemScanner,
    synchronizer: StoreSynchronizer,
    deletion: ClusterDeletionCoordinator,
    orchestrator: RegistrationOrchestrator,
    cache: FingerprintCache,
    /// Changed artifacts not yet registered.
    pending: BTreeMap<ArtifactKey, Deployable>,
    /// Registered artifacts with their descriptors.
    installed: BTreeMap<ArtifactKey, Deployable>,
}

impl PluginDeployer {
    pub fn new(
        class: DeploymentClass,
        plugin_dir: impl Into<PathBuf>,
        server_id: impl Into<String>,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            store,
            parser,
            registrar,
            reloader,
            identity,
        } = collaborators;
        Self {
            class,
            plugin_dir: plugin_dir.into(),
            scan_period: DEFAULT_SCAN_PERIOD,
            scanner: FilesystemScanner::new(parser),
            synchronizer: StoreSynchronizer::new(class, store.clone()),
            deletion: ClusterDeletionCoordinator::new(class, store.clone(), server_id),
            orchestrator: RegistrationOrchestrator::new(
                class,
                store.clone(),
                registrar,
                reloader,
                identity,
            ),
            store,
            cache: FingerprintCache::new(),
            pending: BTreeMap::new(),
            installed: BTreeMap::new(),
        }
    }

    pub fn with_scan_period(mut self, period: Duration) -> Self {
        self.scan_period = period;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.scanner = self.scanner.with_retry(retry);
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scanner = self.scanner.with_extensions(extensions);
        self
    }

    pub fn class(&self) -> DeploymentClass {
        self.class
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Point the deployer at another directory. Everything known about the
    /// old one is forgotten.
    pub fn set_plugin_dir(&mut self, dir: impl Into<PathBuf>) {
        self.plugin_dir = dir.into();
        self.cache = FingerprintCache::new();
        self.pending.clear();
        self.installed.clear();
    }

    pub fn scan_period(&self) -> Duration {
        self.scan_period
    }

    pub fn set_scan_period(&mut self, period: Duration) {
        self.scan_period = period;
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    pub fn pending(&self) -> impl Iterator<Item = &Deployable> {
        self.pending.values()
    }

    pub fn installed(&self) -> impl Iterator<Item = &Deployable> {
        self.installed.values()
    }

    /// Bring the directory in line with the store and collect pending work.
    pub fn scan(&mut self) -> Result<ScanOutcome> {
        let started = Instant::now();
        std::fs::create_dir_all(&self.plugin_dir)?;

        let pending_acks = self.deletion.pending_acknowledgements().unwrap_or_else(|e| {
            warn!("Could not read pending deletions: {}", e);
            HashSet::new()
        });

        let changes = self
            .scanner
            .scan_directory(&self.plugin_dir, &mut self.cache, &pending_acks)?;

        let deletion = self
            .deletion
            .delete_local(&self.plugin_dir, &mut self.cache)
            .unwrap_or_else(|e| {
                warn!("Deletion pass for {} failed: {}", self.class, e);
                DeletionReport::default()
            });

        let records = match self.store.list_records(self.class) {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not list {} records: {}", self.class, e);
                Vec::new()
            }
        };
        let reconcile = self
            .synchronizer
            .reconcile(&self.plugin_dir, &records, &mut self.cache);

        self.collect_pending(&changes, &reconcile, &records);

        let outcome = ScanOutcome {
            pending: self.pending.len(),
            changes,
            deletion,
            reconcile,
        };
        debug!(
            "{} scan of {} finished in {:?}: {} pending",
            self.class,
            self.plugin_dir.display(),
            started.elapsed(),
            outcome.pending
        );
        Ok(outcome)
    }

    /// Scan, then register everything pending in dependency order.
    pub fn scan_and_register(&mut self) -> Result<CycleReport> {
        let scan = self.scan()?;
        if self.pending.is_empty() {
            return Ok(CycleReport {
                scan,
                batch: BatchReport::default(),
            });
        }

        let pending: Vec<Deployable> = self.pending.values().cloned().collect();
        let installed: Vec<Deployable> = self.installed.values().cloned().collect();
        let batch = self.orchestrator.register_batch(&pending, &installed);

        let done: HashSet<&ArtifactKey> = batch
            .registered
            .iter()
            .chain(batch.refused.iter())
            .chain(batch.skipped.iter())
            .collect();
        let registered: HashSet<&ArtifactKey> = batch.registered.iter().collect();

        let finished: Vec<ArtifactKey> = self
            .pending
            .keys()
            .filter(|k| done.contains(k))
            .cloned()
            .collect();
        for key in finished {
            if let Some(mut deployable) = self.pending.remove(&key) {
                if registered.contains(&key) {
                    deployable.content_changed = false;
                    self.installed.insert(key, deployable);
                }
            }
        }

        if batch.attempted() > 0 {
            info!(
                "{} registration: {} registered ({} forced), {} failed, {} pruned",
                self.class,
                batch.registered.len(),
                batch.forced.len(),
                batch.failed.len(),
                batch.pruned.len()
            );
        }
        Ok(CycleReport { scan, batch })
    }

    fn collect_pending(
        &mut self,
        changes: &ChangeSet,
        reconcile: &ReconcileReport,
        records: &[ArtifactRecord],
    ) {
        for scanned in &changes.added {
            let key = scanned.descriptor.key();
            // A file first seen by this process that the store already
            // holds verbatim only needs loading, not a forced refresh.
            let known = records.iter().any(|r| {
                r.is_active() && r.key() == key && r.content_hash == scanned.content_hash
            });
            self.pending.insert(
                key,
                Deployable {
                    descriptor: scanned.descriptor.clone(),
                    path: scanned.path.clone(),
                    content_hash: scanned.content_hash.clone(),
                    mtime: scanned.mtime,
                    content_changed: !known,
                },
            );
        }
        for scanned in &changes.updated {
            self.pending.insert(
                scanned.descriptor.key(),
                Deployable {
                    descriptor: scanned.descriptor.clone(),
                    path: scanned.path.clone(),
                    content_hash: scanned.content_hash.clone(),
                    mtime: scanned.mtime,
                    content_changed: true,
                },
            );
        }

        // Pulled files replaced whatever the scanner saw, so they are always
        // described afresh. Stale store copies keep the scanner's entry.
        let pulled = reconcile.pulled.iter().map(|s| (s, true));
        let kept = reconcile
            .flagged_stale
            .iter()
            .chain(reconcile.pushed.iter().filter(|p| p.content_changed))
            .map(|s| (s, false));
        for (synced, replaced) in pulled.chain(kept) {
            let current = !replaced
                && self
                    .pending
                    .get(&synced.key)
                    .is_some_and(|d| d.path == synced.path && d.content_changed);
            if current {
                continue;
            }
            match self.describe(&synced.path) {
                Ok(deployable) => {
                    self.pending.insert(synced.key.clone(), deployable);
                }
                Err(e) => {
                    // Forget the file so the next scan rediscovers it.
                    warn!("Could not read {}: {}", synced.path.display(), e);
                    self.cache.remove(&synced.path);
                    self.pending.remove(&synced.key);
                }
            }
        }

        for key in &deletion_keys(reconcile, changes) {
            self.pending.remove(key);
        }

        let cache = &self.cache;
        self.pending.retain(|_, d| cache.get(&d.path).is_some());
        self.installed.retain(|_, d| cache.get(&d.path).is_some());
    }

    fn describe(&self, path: &Path) -> Result<Deployable> {
        let entry = self.cache.get(path).cloned();
        let descriptor = self.scanner.parser().parse(path)?;
        let (content_hash, mtime) = match entry {
            Some(e) => (e.content_hash, e.mtime),
            None => (crate::fs::hash_file(path)?, crate::fs::mtime_millis(path)),
        };
        Ok(Deployable {
            descriptor,
            path: path.to_path_buf(),
            content_hash,
            mtime,
            content_changed: true,
        })
    }
}

fn deletion_keys(reconcile: &ReconcileReport, changes: &ChangeSet) -> Vec<ArtifactKey> {
    changes
        .removed_obsolete
        .iter()
        .map(|r| r.key.clone())
        .chain(reconcile.disabled.iter().cloned())
        .collect()
}

impl ScanCycle for PluginDeployer {
    fn run_cycle(&mut self) -> Result<CycleReport> {
        self.scan_and_register()
    }

    fn scan_period(&self) -> Duration {
        PluginDeployer::scan_period(self)
    }

    fn set_scan_period(&mut self, period: Duration) {
        PluginDeployer::set_scan_period(self, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ArchiveDescriptorParser, Descriptor, pack_archive};
    use crate::fs::set_mtime_millis;
    use crate::registration::{AdminIdentity, Identity};
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, bool)>>,
    }

    impl Registrar for Recorder {
        fn register(&self, d: &Descriptor, _: &Path, force: bool) -> anyhow::Result<()> {
            self.calls
                .lock()
                .expect("lock should succeed")
                .push((d.name.clone(), force));
            Ok(())
        }
    }

    impl FacetReloader for Recorder {
        fn reload(&self, _: &Identity) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn deployer(dir: &Path, store: &MemoryStore, recorder: &Arc<Recorder>) -> PluginDeployer {
        PluginDeployer::new(
            DeploymentClass::Agent,
            dir,
            "server-1",
            Collaborators {
                store: Arc::new(store.clone()),
                parser: Arc::new(ArchiveDescriptorParser::new()),
                registrar: recorder.clone(),
                reloader: recorder.clone(),
                identity: Arc::new(AdminIdentity::default()),
            },
        )
        .with_retry(RetryPolicy::none())
    }

    fn drop_jar(dir: &Path, file: &str, d: &Descriptor, mtime: u64) {
        std::fs::create_dir_all(dir).expect("mkdir should succeed");
        let bytes = pack_archive(d, &[]).expect("pack should succeed");
        std::fs::write(dir.join(file), bytes).expect("write should succeed");
        set_mtime_millis(&dir.join(file), mtime).expect("set mtime should succeed");
    }

    fn take_calls(recorder: &Recorder) -> Vec<(String, bool)> {
        std::mem::take(&mut *recorder.calls.lock().expect("lock should succeed"))
    }

    #[test]
    fn test_new_local_file_is_registered_and_published() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let dir = tmp.path().join("agent");
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        drop_jar(&dir, "p.jar", &Descriptor::new("p").with_version("1.0"), 1_000);

        let mut d = deployer(&dir, &store, &recorder);
        let report = d.scan_and_register().expect("cycle should succeed");

        assert_eq!(report.batch.registered, vec![ArtifactKey::new("p")]);
        assert_eq!(take_calls(&recorder), vec![("p".to_string(), true)]);
        assert!(
            store
                .record(DeploymentClass::Agent, &ArtifactKey::new("p"))
                .is_some()
        );
        assert_eq!(d.pending().count(), 0);
        assert_eq!(d.installed().count(), 1);

        let again = d.scan_and_register().expect("cycle should succeed");
        assert!(again.batch.registered.is_empty());
        assert!(take_calls(&recorder).is_empty());
    }

    #[test]
    fn test_restart_with_matching_store_registers_without_force() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let dir = tmp.path().join("agent");
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        drop_jar(&dir, "p.jar", &Descriptor::new("p").with_version("1.0"), 1_000);
        deployer(&dir, &store, &recorder)
            .scan_and_register()
            .expect("cycle should succeed");
        take_calls(&recorder);

        let mut restarted = deployer(&dir, &store, &recorder);
        restarted.scan_and_register().expect("cycle should succeed");
        assert_eq!(take_calls(&recorder), vec![("p".to_string(), false)]);
    }

    #[test]
    fn test_scan_period_and_dir_accessors() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        let mut d = deployer(tmp.path(), &store, &recorder);
        assert_eq!(d.scan_period(), DEFAULT_SCAN_PERIOD);
        d.set_scan_period(Duration::from_secs(5));
        assert_eq!(d.scan_period(), Duration::from_secs(5));

        drop_jar(tmp.path(), "p.jar", &Descriptor::new("p"), 1_000);
        d.scan().expect("scan should succeed");
        assert_eq!(d.cache().len(), 1);

        let other = tmp.path().join("other");
        d.set_plugin_dir(&other);
        assert_eq!(d.plugin_dir(), other.as_path());
        assert!(d.cache().is_empty());
        d.scan().expect("scan should create and scan the new directory");
        assert!(other.is_dir());
    }
}
