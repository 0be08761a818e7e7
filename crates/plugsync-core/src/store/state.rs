//! Record bookkeeping shared by the store backends.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ContentUpdate;
use crate::types::{ArtifactKey, ArtifactRecord, ArtifactStatus, DeploymentClass};
use crate::{Result, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredArtifact {
    pub record: ArtifactRecord,
    #[serde(default)]
    pub acknowledged_by: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    pub servers: BTreeSet<String>,
    #[serde(default)]
    pub artifacts: Vec<StoredArtifact>,
}

impl StoreState {
    fn position(&self, class: DeploymentClass, key: &ArtifactKey) -> Option<usize> {
        self.artifacts.iter().position(|a| {
            a.record.deployment_class == class
                && a.record.name == key.name
                && a.record.type_tag == key.type_tag
        })
    }

    pub fn find(&self, class: DeploymentClass, key: &ArtifactKey) -> Option<&StoredArtifact> {
        self.position(class, key).map(|i| &self.artifacts[i])
    }

    fn find_mut(&mut self, class: DeploymentClass, key: &ArtifactKey) -> Result<&mut StoredArtifact> {
        match self.position(class, key) {
            Some(i) => Ok(&mut self.artifacts[i]),
            None => Err(SyncError::NotFound(format!("{class} artifact {key}"))),
        }
    }

    pub fn records(&self, class: DeploymentClass) -> Vec<ArtifactRecord> {
        self.artifacts
            .iter()
            .filter(|a| a.record.deployment_class == class)
            .map(|a| a.record.clone())
            .collect()
    }

    /// Insert or replace a record wholesale, keeping acknowledgements only
    /// when the status is unchanged.
    pub fn insert(&mut self, record: ArtifactRecord) {
        let key = record.key();
        match self.position(record.deployment_class, &key) {
            Some(i) => {
                let slot = &mut self.artifacts[i];
                if slot.record.status != record.status {
                    slot.acknowledged_by.clear();
                }
                slot.record = record;
            }
            None => self.artifacts.push(StoredArtifact {
                record,
                acknowledged_by: BTreeSet::new(),
            }),
        }
    }

    /// Apply a verified content update. Returns the resulting record.
    pub fn apply_update(
        &mut self,
        class: DeploymentClass,
        key: &ArtifactKey,
        update: &ContentUpdate,
    ) -> Result<ArtifactRecord> {
        if let Some(i) = self.position(class, key) {
            let record = &mut self.artifacts[i].record;
            if record.status != ArtifactStatus::Installed {
                return Err(SyncError::Refused(format!(
                    "{class} artifact {key} is {:?}; content updates are not accepted",
                    record.status
                )));
            }
            record.path = update.path.clone();
            record.content_hash = update.content_hash.clone();
            record.mtime = update.mtime;
            record.version = update.version.clone();
            record.has_content = true;
            return Ok(record.clone());
        }

        let record = ArtifactRecord {
            name: key.name.clone(),
            deployment_class: class,
            path: update.path.clone(),
            content_hash: update.content_hash.clone(),
            version: update.version.clone(),
            mtime: update.mtime,
            enabled: true,
            status: ArtifactStatus::Installed,
            type_tag: key.type_tag.clone(),
            has_content: true,
        };
        self.artifacts.push(StoredArtifact {
            record: record.clone(),
            acknowledged_by: BTreeSet::new(),
        });
        Ok(record)
    }

    pub fn mark_deleted(&mut self, class: DeploymentClass, key: &ArtifactKey) -> Result<()> {
        let artifact = self.find_mut(class, key)?;
        if artifact.record.status == ArtifactStatus::Installed {
            artifact.record.status = ArtifactStatus::Deleted;
            artifact.record.enabled = false;
            artifact.acknowledged_by.clear();
        }
        Ok(())
    }

    /// Acknowledge the DELETED records among `keys`. Records retired after
    /// the caller listed them are not in `keys` and stay pending.
    pub fn acknowledge(
        &mut self,
        class: DeploymentClass,
        server_id: &str,
        keys: &[ArtifactKey],
    ) -> usize {
        self.servers.insert(server_id.to_string());
        let servers = &self.servers;
        let mut purgeable = 0;
        for artifact in self
            .artifacts
            .iter_mut()
            .filter(|a| a.record.deployment_class == class)
            .filter(|a| a.record.status == ArtifactStatus::Deleted)
            .filter(|a| keys.contains(&a.record.key()))
        {
            artifact.acknowledged_by.insert(server_id.to_string());
            if servers.is_subset(&artifact.acknowledged_by) {
                artifact.record.status = ArtifactStatus::MarkedForPurge;
                purgeable += 1;
            }
        }
        purgeable
    }

    pub fn pending_acknowledgements(
        &self,
        class: DeploymentClass,
        server_id: &str,
    ) -> Vec<ArtifactKey> {
        self.artifacts
            .iter()
            .filter(|a| a.record.deployment_class == class)
            .filter(|a| a.record.status == ArtifactStatus::Deleted)
            .filter(|a| !a.acknowledged_by.contains(server_id))
            .map(|a| a.record.key())
            .collect()
    }

    pub fn set_enabled(
        &mut self,
        class: DeploymentClass,
        key: &ArtifactKey,
        enabled: bool,
    ) -> Result<()> {
        let artifact = self.find_mut(class, key)?;
        if artifact.record.status != ArtifactStatus::Installed {
            return Err(SyncError::Refused(format!(
                "{class} artifact {key} is {:?}",
                artifact.record.status
            )));
        }
        artifact.record.enabled = enabled;
        Ok(())
    }
}
