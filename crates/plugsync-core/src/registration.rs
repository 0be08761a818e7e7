//! Dependency-ordered registration of changed artifacts.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::descriptor::Descriptor;
use crate::graph::{DependencyGraph, PrunedNode, node_id};
use crate::store::{ArtifactStore, ContentUpdate};
use crate::sync::file_name_of;
use crate::types::{ArtifactKey, ArtifactStatus, DeploymentClass};
use crate::SyncError;

/// The service that turns a descriptor into live type metadata.
pub trait Registrar: Send + Sync {
    fn register(
        &self,
        descriptor: &Descriptor,
        content_file: &Path,
        force_update: bool,
    ) -> anyhow::Result<()>;
}

/// Reloads the type facet cache after a batch.
pub trait FacetReloader: Send + Sync {
    fn reload(&self, identity: &Identity) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
}

pub trait IdentityProvider: Send + Sync {
    fn overlord(&self) -> Identity;
}

/// Fixed administrative identity.
#[derive(Debug, Clone)]
pub struct AdminIdentity {
    name: String,
}

impl AdminIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for AdminIdentity {
    fn default() -> Self {
        Self::new("overlord")
    }
}

impl IdentityProvider for AdminIdentity {
    fn overlord(&self) -> Identity {
        Identity {
            name: self.name.clone(),
        }
    }
}

/// An artifact on disk with its parsed descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployable {
    pub descriptor: Descriptor,
    pub path: PathBuf,
    pub content_hash: String,
    pub mtime: u64,
    /// Content differs from what was last registered.
    pub content_changed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub registered: Vec<ArtifactKey>,
    /// Registered with `force_update` set.
    pub forced: Vec<ArtifactKey>,
    pub failed: Vec<(ArtifactKey, SyncError)>,
    /// Pending nodes left out because a required dependency is unavailable.
    pub pruned: Vec<PrunedNode>,
    /// Store record is retired; registration will never be attempted again.
    pub refused: Vec<ArtifactKey>,
    /// Disabled in the store.
    pub skipped: Vec<ArtifactKey>,
    pub reloaded: bool,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.registered.len() + self.failed.len()
    }
}

pub struct RegistrationOrchestrator {
    class: DeploymentClass,
    store: Arc<dyn ArtifactStore>,
    registrar: Arc<dyn Registrar>,
    reloader: Arc<dyn FacetReloader>,
    identity: Arc<dyn IdentityProvider>,
}

impl RegistrationOrchestrator {
    pub fn new(
        class: DeploymentClass,
        store: Arc<dyn ArtifactStore>,
        registrar: Arc<dyn Registrar>,
        reloader: Arc<dyn FacetReloader>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            class,
            store,
            registrar,
            reloader,
            identity,
        }
    }

    /// Register `pending` in dependency order.
    ///
    /// `installed` are artifacts already registered earlier; they resolve
    /// dependencies and are re-registered only when they optionally depend
    /// on something whose content changed.
    pub fn register_batch(&self, pending: &[Deployable], installed: &[Deployable]) -> BatchReport {
        let mut report = BatchReport::default();
        if pending.is_empty() {
            return report;
        }

        let mut by_id: HashMap<String, &Deployable> = HashMap::new();
        for d in installed.iter().chain(pending.iter()) {
            by_id.insert(node_id(&d.descriptor.key()), d);
        }
        let pending_ids: BTreeSet<String> = pending
            .iter()
            .map(|d| node_id(&d.descriptor.key()))
            .collect();

        let graph = DependencyGraph::from_descriptors(
            installed
                .iter()
                .filter(|d| !pending_ids.contains(&node_id(&d.descriptor.key())))
                .chain(pending.iter())
                .map(|d| &d.descriptor),
        );

        let mut forced: BTreeSet<String> = BTreeSet::new();
        for d in pending.iter().filter(|d| d.content_changed) {
            let id = node_id(&d.descriptor.key());
            for dependent in graph.optional_dependents_of(&id) {
                if !pending_ids.contains(&dependent) {
                    debug!("{} optionally depends on changed {}, refreshing", dependent, id);
                }
                forced.insert(dependent);
            }
            forced.insert(id);
        }

        let plan = graph.plan();
        for pruned in plan.excluded {
            if pending_ids.contains(&pruned.name) || forced.contains(&pruned.name) {
                let err = SyncError::DependencyUnsatisfied {
                    name: pruned.name.clone(),
                    chain: pruned.to_string(),
                };
                warn!("Not registering {}: {}", pruned.name, err);
                report.pruned.push(pruned);
            }
        }

        let records: HashMap<ArtifactKey, _> = match self.store.list_records(self.class) {
            Ok(records) => records.into_iter().map(|r| (r.key(), r)).collect(),
            Err(e) => {
                warn!("Could not list {} records before registering: {}", self.class, e);
                HashMap::new()
            }
        };

        for id in plan.order {
            let in_batch = pending_ids.contains(&id) || forced.contains(&id);
            let Some(&deployable) = by_id.get(&id).filter(|_| in_batch) else {
                continue;
            };
            let key = deployable.descriptor.key();

            if let Some(record) = records.get(&key) {
                if record.status != ArtifactStatus::Installed {
                    warn!(
                        "Refusing to register {}: store record is {:?}",
                        key, record.status
                    );
                    report.refused.push(key);
                    continue;
                }
                if !record.enabled {
                    info!("Skipping disabled {} artifact {}", self.class, key);
                    report.skipped.push(key);
                    continue;
                }
            }

            let force = forced.contains(&id);
            match self.register_one(deployable, force) {
                Ok(()) => {
                    info!(
                        "Registered {} artifact {}{}",
                        self.class,
                        key,
                        if force { " (forced)" } else { "" }
                    );
                    if force {
                        report.forced.push(key.clone());
                    }
                    report.registered.push(key);
                }
                Err(e) => {
                    error!("Registration of {} failed: {}", key, e);
                    report.failed.push((key, e));
                }
            }
        }

        if report.attempted() > 0 {
            let identity = self.identity.overlord();
            match self.reloader.reload(&identity) {
                Ok(()) => report.reloaded = true,
                Err(e) => warn!("Type facet reload as {} failed: {:#}", identity.name, e),
            }
        }

        report
    }

    fn register_one(&self, deployable: &Deployable, force: bool) -> crate::Result<()> {
        let descriptor = &deployable.descriptor;
        self.registrar
            .register(descriptor, &deployable.path, force)
            .map_err(|e| SyncError::Registration {
                name: descriptor.name.clone(),
                reason: format!("{e:#}"),
            })?;
        self.publish(deployable)
    }

    /// Make the store match what was just registered.
    fn publish(&self, deployable: &Deployable) -> crate::Result<()> {
        let key = deployable.descriptor.key();
        let path = file_name_of(&deployable.path)?;
        let current = self
            .store
            .list_records(self.class)?
            .into_iter()
            .find(|r| r.key() == key);

        let up_to_date = current.as_ref().is_some_and(|r| {
            r.has_content
                && r.content_hash == deployable.content_hash
                && r.path == path
                && r.version == deployable.descriptor.version
        });
        if up_to_date {
            return Ok(());
        }

        self.store
            .update_content(
                self.class,
                &key,
                ContentUpdate {
                    path,
                    version: deployable.descriptor.version.clone(),
                    mtime: deployable.mtime,
                    content_hash: deployable.content_hash.clone(),
                    source: deployable.path.clone(),
                },
            )
            .map_err(|e| match e {
                SyncError::StoreTransaction { .. } | SyncError::Refused(_) => e,
                other => SyncError::store(&key.name, other),
            })?;
        debug!("Published {} to the store", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::hash_bytes;
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn keys(names: &[&str]) -> Vec<ArtifactKey> {
        names.iter().map(|n| ArtifactKey::new(*n)).collect()
    }

    #[derive(Default)]
    struct RecordingRegistrar {
        calls: Mutex<Vec<(String, bool)>>,
        fail: Vec<String>,
    }

    impl Registrar for RecordingRegistrar {
        fn register(&self, d: &Descriptor, _file: &Path, force: bool) -> anyhow::Result<()> {
            self.calls
                .lock()
                .expect("lock should succeed")
                .push((d.name.clone(), force));
            if self.fail.contains(&d.name) {
                anyhow::bail!("descriptor rejected");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingReloader {
        calls: Mutex<Vec<String>>,
    }

    impl FacetReloader for CountingReloader {
        fn reload(&self, identity: &Identity) -> anyhow::Result<()> {
            self.calls
                .lock()
                .expect("lock should succeed")
                .push(identity.name.clone());
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        dir: PathBuf,
        store: MemoryStore,
        registrar: Arc<RecordingRegistrar>,
        reloader: Arc<CountingReloader>,
    }

    impl Fixture {
        fn new(fail: &[&str]) -> Self {
            let tmp = TempDir::new().expect("tempdir should succeed");
            let dir = tmp.path().to_path_buf();
            Self {
                _tmp: tmp,
                dir,
                store: MemoryStore::new(),
                registrar: Arc::new(RecordingRegistrar {
                    calls: Mutex::new(Vec::new()),
                    fail: fail.iter().map(|s| s.to_string()).collect(),
                }),
                reloader: Arc::new(CountingReloader::default()),
            }
        }

        fn orchestrator(&self) -> RegistrationOrchestrator {
            RegistrationOrchestrator::new(
                DeploymentClass::Server,
                Arc::new(self.store.clone()),
                self.registrar.clone(),
                self.reloader.clone(),
                Arc::new(AdminIdentity::default()),
            )
        }

        fn deployable(&self, descriptor: Descriptor, changed: bool) -> Deployable {
            let bytes = format!("{}:{:?}", descriptor.name, descriptor.version);
            let path = self.dir.join(format!("{}.jar", descriptor.name));
            std::fs::write(&path, &bytes).expect("write should succeed");
            Deployable {
                descriptor,
                path,
                content_hash: hash_bytes(bytes.as_bytes()),
                mtime: 1_000,
                content_changed: changed,
            }
        }

        fn calls(&self) -> Vec<(String, bool)> {
            self.registrar
                .calls
                .lock()
                .expect("lock should succeed")
                .clone()
        }

        fn reloads(&self) -> usize {
            self.reloader.calls.lock().expect("lock should succeed").len()
        }
    }

    #[test]
    fn test_registers_in_dependency_order_and_publishes() {
        let fx = Fixture::new(&[]);
        let pending = vec![
            fx.deployable(Descriptor::new("alerts").with_version("1.0").requires("platform"), true),
            fx.deployable(Descriptor::new("platform").with_version("1.0"), true),
        ];

        let report = fx.orchestrator().register_batch(&pending, &[]);

        assert_eq!(
            fx.calls(),
            vec![("platform".to_string(), true), ("alerts".to_string(), true)]
        );
        assert_eq!(report.registered, keys(&["platform", "alerts"]));
        assert!(report.reloaded);
        assert_eq!(fx.reloads(), 1);
        let record = fx
            .store
            .record(DeploymentClass::Server, &ArtifactKey::new("alerts"))
            .expect("record should be published");
        assert_eq!(record.path, "alerts.jar");
        assert_eq!(record.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_failure_does_not_stop_batch() {
        let fx = Fixture::new(&["a"]);
        let pending = vec![
            fx.deployable(Descriptor::new("a"), true),
            fx.deployable(Descriptor::new("b"), true),
        ];

        let report = fx.orchestrator().register_batch(&pending, &[]);
        assert_eq!(report.registered, keys(&["b"]));
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, SyncError::Registration { .. }));
        assert_eq!(fx.reloads(), 1);
        assert!(
            fx.store
                .record(DeploymentClass::Server, &ArtifactKey::new("a"))
                .is_none()
        );
    }

    #[test]
    fn test_unsatisfied_nodes_are_pruned_not_attempted() {
        let fx = Fixture::new(&[]);
        let pending = vec![
            fx.deployable(Descriptor::new("a").requires("missing"), true),
            fx.deployable(Descriptor::new("b"), true),
        ];

        let report = fx.orchestrator().register_batch(&pending, &[]);
        assert_eq!(fx.calls(), vec![("b".to_string(), true)]);
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(report.pruned[0].to_string(), "a -> missing (missing)");
    }

    #[test]
    fn test_installed_dependency_satisfies_pending_node() {
        let fx = Fixture::new(&[]);
        let installed = vec![fx.deployable(Descriptor::new("platform"), false)];
        let pending = vec![fx.deployable(Descriptor::new("alerts").requires("platform"), true)];

        let report = fx.orchestrator().register_batch(&pending, &installed);
        assert_eq!(report.registered, keys(&["alerts"]));
        assert_eq!(fx.calls(), vec![("alerts".to_string(), true)]);
    }

    #[test]
    fn test_optional_dependent_of_changed_node_is_forced() {
        let fx = Fixture::new(&[]);
        let installed = vec![
            fx.deployable(Descriptor::new("parent").with_version("1.0"), false),
            fx.deployable(Descriptor::new("child").optionally("parent"), false),
            fx.deployable(Descriptor::new("bystander"), false),
        ];
        let pending = vec![fx.deployable(Descriptor::new("parent").with_version("2.0"), true)];

        let report = fx.orchestrator().register_batch(&pending, &installed);
        assert_eq!(
            fx.calls(),
            vec![("parent".to_string(), true), ("child".to_string(), true)]
        );
        assert_eq!(report.forced, keys(&["parent", "child"]));
    }

    #[test]
    fn test_unchanged_pending_is_not_forced() {
        let fx = Fixture::new(&[]);
        let pending = vec![
            fx.deployable(Descriptor::new("p"), false),
            fx.deployable(Descriptor::new("c").optionally("p"), false),
        ];
        let report = fx.orchestrator().register_batch(&pending, &[]);
        assert_eq!(
            fx.calls(),
            vec![("p".to_string(), false), ("c".to_string(), false)]
        );
        assert!(report.forced.is_empty());
    }

    #[test]
    fn test_deleted_record_is_refused() {
        let fx = Fixture::new(&[]);
        let d = fx.deployable(Descriptor::new("gone"), true);
        fx.orchestrator().register_batch(std::slice::from_ref(&d), &[]);
        fx.store
            .mark_deleted(DeploymentClass::Server, &ArtifactKey::new("gone"))
            .expect("delete should succeed");

        let report = fx.orchestrator().register_batch(&[d], &[]);
        assert_eq!(report.refused, keys(&["gone"]));
        assert_eq!(fx.calls().len(), 1);
        assert!(!report.reloaded);
    }

    #[test]
    fn test_same_name_with_different_type_tags_are_separate_artifacts() {
        let fx = Fixture::new(&[]);
        let a = fx.deployable(Descriptor::new("x").with_type_tag("a"), true);
        let b_path = fx.dir.join("x-b.jar");
        std::fs::write(&b_path, "x-b").expect("write should succeed");
        let b = Deployable {
            descriptor: Descriptor::new("x").with_type_tag("b"),
            path: b_path,
            content_hash: hash_bytes(b"x-b"),
            mtime: 1_000,
            content_changed: true,
        };

        let report = fx.orchestrator().register_batch(&[a, b], &[]);

        let key_a = ArtifactKey::new("x").with_type_tag("a");
        let key_b = ArtifactKey::new("x").with_type_tag("b");
        assert_eq!(report.registered, vec![key_a.clone(), key_b.clone()]);
        assert_eq!(fx.calls().len(), 2);
        let stored_b = fx
            .store
            .record(DeploymentClass::Server, &key_b)
            .expect("second tag should be published");
        assert_eq!(stored_b.path, "x-b.jar");
        assert!(fx.store.record(DeploymentClass::Server, &key_a).is_some());
    }

    #[test]
    fn test_empty_batch_does_not_reload() {
        let fx = Fixture::new(&[]);
        let report = fx.orchestrator().register_batch(&[], &[]);
        assert_eq!(report.attempted(), 0);
        assert_eq!(fx.reloads(), 0);
    }
}
