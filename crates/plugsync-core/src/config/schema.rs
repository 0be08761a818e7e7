//! Configuration schema for plugsync.toml

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scanner::RetryPolicy;
use crate::types::DeploymentClass;

/// Root configuration structure for plugsync.toml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugsyncConfig {
    /// Identity of this server in the cluster
    #[serde(default = "default_server_id")]
    pub server_id: String,

    #[serde(default = "default_scan_period_secs")]
    pub scan_period_secs: u64,

    /// Deployment directory for agent plugins
    #[serde(default)]
    pub agent_dir: Option<PathBuf>,

    /// Deployment directory for server plugins
    #[serde(default)]
    pub server_dir: Option<PathBuf>,

    /// Root of the file-backed artifact store
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// File extensions treated as deployable archives
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_server_id() -> String {
    "localhost".to_string()
}

fn default_scan_period_secs() -> u64 {
    300
}

fn default_extensions() -> Vec<String> {
    vec!["jar".to_string()]
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        RetryPolicy {
            attempts: config.attempts,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

impl Default for PlugsyncConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            scan_period_secs: default_scan_period_secs(),
            agent_dir: None,
            server_dir: None,
            store_dir: None,
            extensions: default_extensions(),
            retry: RetryConfig::default(),
        }
    }
}

impl PlugsyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan_period(&self) -> Duration {
        Duration::from_secs(self.scan_period_secs)
    }

    /// Deployment directory for `class`, falling back to the state directory.
    pub fn plugin_dir(&self, class: DeploymentClass) -> PathBuf {
        let configured = match class {
            DeploymentClass::Agent => self.agent_dir.as_ref(),
            DeploymentClass::Server => self.server_dir.as_ref(),
        };
        configured
            .cloned()
            .unwrap_or_else(|| super::state_dir().join("plugins").join(class.as_str()))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| super::state_dir().join("store"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_id.trim().is_empty() {
            anyhow::bail!("server_id must not be empty");
        }
        if self.scan_period_secs == 0 {
            anyhow::bail!("scan_period_secs must be at least 1");
        }
        if self.extensions.is_empty() {
            anyhow::bail!("extensions must list at least one archive extension");
        }
        if let Some(ext) = self.extensions.iter().find(|e| e.starts_with('.') || e.is_empty()) {
            anyhow::bail!("Invalid extension '{}': use the bare extension, e.g. \"jar\"", ext);
        }
        if self.retry.attempts == 0 {
            anyhow::bail!("retry.attempts must be at least 1");
        }
        if let (Some(agent), Some(server)) = (&self.agent_dir, &self.server_dir) {
            if agent == server {
                anyhow::bail!(
                    "agent_dir and server_dir must differ (both are {})",
                    agent.display()
                );
            }
        }
        Ok(())
    }
}
