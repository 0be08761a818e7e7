//! Operator actions with dependency checks.
//!
//! Each action validates the whole request before touching the store, so a
//! refused request changes nothing.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::descriptor::{Descriptor, DescriptorParser};
use crate::graph::{DependencyGraph, node_id};
use crate::store::ArtifactStore;
use crate::types::{ArtifactRecord, ArtifactStatus, DeploymentClass};
use crate::{Result, SyncError};

pub struct PluginAdmin {
    class: DeploymentClass,
    store: Arc<dyn ArtifactStore>,
}

impl PluginAdmin {
    pub fn new(class: DeploymentClass, store: Arc<dyn ArtifactStore>) -> Self {
        Self { class, store }
    }

    /// Dependency graph of every installed record, parsed from store content.
    /// Records whose content cannot be read or parsed are left out.
    pub fn load_graph(&self, parser: &dyn DescriptorParser) -> Result<DependencyGraph> {
        let mut descriptors = Vec::new();
        for record in self.installed()? {
            if !record.has_content {
                continue;
            }
            match self.parse_record(&record, parser) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => warn!("Leaving {} out of the dependency graph: {}", record.key(), e),
            }
        }
        Ok(DependencyGraph::from_descriptors(&descriptors))
    }

    fn parse_record(
        &self,
        record: &ArtifactRecord,
        parser: &dyn DescriptorParser,
    ) -> Result<Descriptor> {
        let mut content = self.store.read_content(self.class, &record.key())?;
        let mut tmp = NamedTempFile::new()?;
        std::io::copy(&mut content, tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
        parser.parse(tmp.path())
    }

    fn installed(&self) -> Result<Vec<ArtifactRecord>> {
        Ok(self
            .store
            .list_records(self.class)?
            .into_iter()
            .filter(|r| r.status == ArtifactStatus::Installed)
            .collect())
    }

    /// Installed records keyed by graph node id.
    fn by_id(&self) -> Result<HashMap<String, ArtifactRecord>> {
        Ok(self
            .installed()?
            .into_iter()
            .map(|r| (node_id(&r.key()), r))
            .collect())
    }

    /// Node ids named by the request. A bare name matches every type tag
    /// installed under it; `name[tag]` matches exactly one record.
    fn resolve(
        records: &HashMap<String, ArtifactRecord>,
        names: &[String],
    ) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        for n in names {
            if records.contains_key(n) {
                ids.insert(n.clone());
                continue;
            }
            let before = ids.len();
            ids.extend(
                records
                    .iter()
                    .filter(|(_, r)| &r.name == n)
                    .map(|(id, _)| id.clone()),
            );
            if ids.len() == before {
                return Err(SyncError::NotFound(format!("installed plugin '{n}'")));
            }
        }
        Ok(ids)
    }

    /// Enable `names`. Refused unless every dependency is already enabled
    /// or part of the request.
    pub fn enable(&self, graph: &DependencyGraph, names: &[String]) -> Result<()> {
        let records = self.by_id()?;
        let targets = Self::resolve(&records, names)?;

        let blocking: BTreeSet<String> = targets
            .iter()
            .flat_map(|id| graph.all_dependencies(id))
            .filter(|dep| !targets.contains(dep))
            .filter(|dep| records.get(dep).is_some_and(|r| !r.enabled))
            .collect();
        if !blocking.is_empty() {
            return Err(SyncError::Refused(format!(
                "enable these dependencies as well: {}",
                join(&blocking)
            )));
        }

        for id in &targets {
            self.set_enabled(&records, id, true)?;
        }
        Ok(())
    }

    /// Disable `names`. Refused unless every dependent is already disabled
    /// or part of the request.
    pub fn disable(&self, graph: &DependencyGraph, names: &[String]) -> Result<()> {
        let records = self.by_id()?;
        let targets = Self::resolve(&records, names)?;
        let blocking = Self::enabled_dependents(graph, &records, &targets);
        if !blocking.is_empty() {
            return Err(SyncError::Refused(format!(
                "disable these dependent plugins as well: {}",
                join(&blocking)
            )));
        }

        for id in &targets {
            self.set_enabled(&records, id, false)?;
        }
        Ok(())
    }

    /// Retire `names` cluster-wide. Refused unless every enabled dependent
    /// is deleted along with them.
    pub fn delete(&self, graph: &DependencyGraph, names: &[String]) -> Result<()> {
        let records = self.by_id()?;
        let targets = Self::resolve(&records, names)?;
        let blocking = Self::enabled_dependents(graph, &records, &targets);
        if !blocking.is_empty() {
            return Err(SyncError::Refused(format!(
                "delete these dependent plugins as well: {}",
                join(&blocking)
            )));
        }

        for record in targets.iter().filter_map(|id| records.get(id)) {
            self.store.mark_deleted(self.class, &record.key())?;
            info!("Marked {} plugin {} deleted", self.class, record.key());
        }
        Ok(())
    }

    /// Records every server has finished deleting.
    pub fn ready_for_purge(&self) -> Result<Vec<ArtifactRecord>> {
        Ok(self
            .store
            .list_records(self.class)?
            .into_iter()
            .filter(|r| r.status == ArtifactStatus::MarkedForPurge)
            .collect())
    }

    fn set_enabled(
        &self,
        records: &HashMap<String, ArtifactRecord>,
        id: &str,
        enabled: bool,
    ) -> Result<()> {
        let Some(record) = records.get(id) else {
            return Ok(());
        };
        self.store.set_enabled(self.class, &record.key(), enabled)?;
        let verb = if enabled { "Enabled" } else { "Disabled" };
        info!("{} {} plugin {}", verb, self.class, record.key());
        Ok(())
    }

    fn enabled_dependents(
        graph: &DependencyGraph,
        records: &HashMap<String, ArtifactRecord>,
        targets: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        targets
            .iter()
            .flat_map(|id| graph.all_dependents(id))
            .filter(|dep| !targets.contains(dep))
            .filter(|dep| records.get(dep).is_some_and(|r| r.enabled))
            .collect()
    }
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}
