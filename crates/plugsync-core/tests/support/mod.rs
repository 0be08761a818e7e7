#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plugsync_core::deployer::{Collaborators, PluginDeployer};
use plugsync_core::descriptor::{ArchiveDescriptorParser, Descriptor, pack_archive};
use plugsync_core::fs::{hash_bytes, hash_file, set_mtime_millis};
use plugsync_core::registration::{AdminIdentity, FacetReloader, Identity, Registrar};
use plugsync_core::scanner::RetryPolicy;
use plugsync_core::store::{ArtifactStore, MemoryStore};
use plugsync_core::types::{ArtifactRecord, ArtifactStatus, DeploymentClass};

pub const CLASS: DeploymentClass = DeploymentClass::Agent;

/// Registrar and facet reloader that remember every call.
#[derive(Default)]
pub struct Host {
    calls: Mutex<Vec<(String, bool)>>,
    reloads: Mutex<usize>,
}

impl Host {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registrations since the last call, in order.
    pub fn take(&self) -> Vec<(String, bool)> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn reloads(&self) -> usize {
        *self.reloads.lock().unwrap()
    }
}

impl Registrar for Host {
    fn register(&self, descriptor: &Descriptor, file: &Path, force: bool) -> anyhow::Result<()> {
        anyhow::ensure!(file.is_file(), "{} is not on disk", file.display());
        self.calls
            .lock()
            .unwrap()
            .push((descriptor.name.clone(), force));
        Ok(())
    }
}

impl FacetReloader for Host {
    fn reload(&self, _identity: &Identity) -> anyhow::Result<()> {
        *self.reloads.lock().unwrap() += 1;
        Ok(())
    }
}

pub fn deployer(
    dir: &Path,
    store: Arc<dyn ArtifactStore>,
    host: &Arc<Host>,
    server_id: &str,
) -> PluginDeployer {
    deployer_for(CLASS, dir, store, host, server_id)
}

pub fn deployer_for(
    class: DeploymentClass,
    dir: &Path,
    store: Arc<dyn ArtifactStore>,
    host: &Arc<Host>,
    server_id: &str,
) -> PluginDeployer {
    PluginDeployer::new(
        class,
        dir,
        server_id,
        Collaborators {
            store,
            parser: Arc::new(ArchiveDescriptorParser::new()),
            registrar: host.clone(),
            reloader: host.clone(),
            identity: Arc::new(AdminIdentity::default()),
        },
    )
    .with_scan_period(Duration::from_secs(1))
    .with_retry(RetryPolicy::none())
}

pub fn jar(descriptor: &Descriptor) -> Vec<u8> {
    pack_archive(descriptor, &[]).unwrap()
}

/// Write an archive for `descriptor` into `dir` with the given mtime.
pub fn drop_jar(dir: &Path, file: &str, descriptor: &Descriptor, mtime: u64) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(file);
    std::fs::write(&path, jar(descriptor)).unwrap();
    set_mtime_millis(&path, mtime).unwrap();
    path
}

/// Put `descriptor` into the store as an installed, enabled record.
pub fn seed(store: &MemoryStore, file: &str, descriptor: &Descriptor, mtime: u64) -> ArtifactRecord {
    let bytes = jar(descriptor);
    let record = ArtifactRecord {
        name: descriptor.name.clone(),
        deployment_class: CLASS,
        path: file.to_string(),
        content_hash: hash_bytes(&bytes),
        version: descriptor.version.clone(),
        mtime,
        enabled: true,
        status: ArtifactStatus::Installed,
        type_tag: descriptor.type_tag.clone(),
        has_content: true,
    };
    store.insert(record.clone(), Some(bytes)).unwrap();
    record
}

/// Names of the archives currently in `dir`, sorted.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

pub fn hash_of(path: &Path) -> String {
    hash_file(path).unwrap()
}

pub fn calls(list: &[(&str, bool)]) -> Vec<(String, bool)> {
    list.iter().map(|(n, f)| (n.to_string(), *f)).collect()
}
