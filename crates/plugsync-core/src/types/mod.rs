//! Shared data model used by the store, the scanner and the registration layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which family of plugins an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentClass {
    /// Plugins shipped to agents.
    Agent,
    /// Plugins loaded by the server itself.
    Server,
}

impl DeploymentClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentClass::Agent => "agent",
            DeploymentClass::Server => "server",
        }
    }
}

impl fmt::Display for DeploymentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a store record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Installed,
    /// Retired by an operator; servers are removing their local copies.
    Deleted,
    /// Every known server acknowledged the deletion.
    MarkedForPurge,
}

/// Logical identity of an artifact within one deployment class.
///
/// Two files only compete with each other when both the name and the type
/// tag match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
}

impl ArtifactKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: None,
        }
    }

    pub fn with_type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = Some(type_tag.into());
        self
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.type_tag {
            Some(tag) => write!(f, "{}[{}]", self.name, tag),
            None => f.write_str(&self.name),
        }
    }
}

/// Canonical record of an artifact as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub name: String,
    pub deployment_class: DeploymentClass,
    /// File name inside the deployment directory.
    pub path: String,
    pub content_hash: String,
    /// Raw version string; `None` when the artifact declared none.
    #[serde(default)]
    pub version: Option<String>,
    /// Milliseconds since the epoch, 0 when unknown.
    pub mtime: u64,
    pub enabled: bool,
    pub status: ArtifactStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    /// False only for legacy rows whose content blob was never stored.
    #[serde(default = "default_true")]
    pub has_content: bool,
}

fn default_true() -> bool {
    true
}

impl ArtifactRecord {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            name: self.name.clone(),
            type_tag: self.type_tag.clone(),
        }
    }

    /// Enabled and installed: the only records that drive reconciliation.
    pub fn is_active(&self) -> bool {
        self.enabled && self.status == ArtifactStatus::Installed
    }
}
