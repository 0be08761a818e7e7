//! Configuration loading
//!
//! Looked up in order: an explicit path, `$PLUGSYNC_CONFIG`, then
//! `plugsync.toml` in the platform config directory. A missing default file
//! yields the built-in defaults.

pub mod parser;
pub mod schema;

use std::path::{Path, PathBuf};

use anyhow::Context;

pub use parser::{parse_config, parse_config_str, to_toml};
pub use schema::{PlugsyncConfig, RetryConfig};

pub const CONFIG_FILE: &str = "plugsync.toml";
pub const CONFIG_ENV: &str = "PLUGSYNC_CONFIG";

/// Default location of plugsync.toml
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("plugsync").join(CONFIG_FILE))
}

/// Base directory for plugin directories and the file store.
pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("plugsync")
}

/// Load the configuration, honoring an explicit path first.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<PlugsyncConfig> {
    if let Some(path) = explicit {
        return parse_config(path);
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return parse_config(Path::new(&path))
            .with_context(|| format!("{} points at an unusable file", CONFIG_ENV));
    }
    match default_config_path() {
        Some(path) if path.exists() => parse_config(&path),
        _ => Ok(PlugsyncConfig::default()),
    }
}
