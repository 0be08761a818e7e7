//! Plugin descriptors: the identity and dependency fields read out of an
//! artifact.
//!
//! An artifact is a zip archive carrying `META-INF/plugin.toml`:
//!
//! ```toml
//! [plugin]
//! name = "alerts"
//! version = "1.4.0"
//! type = "alert-sender"
//!
//! [dependencies]
//! required = ["platform"]
//! optional = ["jmx"]
//! ```

pub mod archive;
pub mod bare;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::ArtifactKey;

pub use archive::{ArchiveDescriptorParser, DESCRIPTOR_ENTRY, MANIFEST_ENTRY, pack_archive};
pub use bare::{BARE_SUFFIX, WRAPPED_PREFIX, is_bare_descriptor, wrap_bare_descriptor};

/// Parsed identity and dependency requirements of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub name: String,
    pub version: Option<String>,
    pub type_tag: Option<String>,
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

impl Descriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.type_tag = Some(type_tag.into());
        self
    }

    pub fn requires(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn optionally(mut self, name: impl Into<String>) -> Self {
        self.optional.push(name.into());
        self
    }

    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            name: self.name.clone(),
            type_tag: self.type_tag.clone(),
        }
    }

    /// Parse the TOML form. Errors carry the toml message verbatim.
    pub fn from_toml(content: &str) -> std::result::Result<Self, String> {
        let raw: RawDescriptor = toml::from_str(content).map_err(|e| e.to_string())?;
        let name = raw.plugin.name.trim().to_string();
        if name.is_empty() {
            return Err("plugin name must not be empty".to_string());
        }
        Ok(Self {
            name,
            version: raw.plugin.version.filter(|v| !v.trim().is_empty()),
            type_tag: raw.plugin.type_tag,
            required: raw.dependencies.required,
            optional: raw.dependencies.optional,
        })
    }

    pub fn to_toml(&self) -> String {
        let raw = RawDescriptor {
            plugin: PluginSection {
                name: self.name.clone(),
                version: self.version.clone(),
                type_tag: self.type_tag.clone(),
            },
            dependencies: DependencySection {
                required: self.required.clone(),
                optional: self.optional.clone(),
            },
        };
        // Plain strings and string arrays always serialize.
        toml::to_string_pretty(&raw).unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawDescriptor {
    plugin: PluginSection,
    #[serde(default)]
    dependencies: DependencySection,
}

#[derive(Debug, Serialize, Deserialize)]
struct PluginSection {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    type_tag: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DependencySection {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    optional: Vec<String>,
}

/// Reads a [`Descriptor`] out of an artifact file.
///
/// Implementations report unreadable input as
/// [`SyncError::CorruptArtifact`](crate::SyncError::CorruptArtifact) so the
/// scanner can retry it and skip it for the cycle.
pub trait DescriptorParser: Send + Sync {
    fn parse(&self, path: &Path) -> crate::Result<Descriptor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_descriptor() {
        let toml = r#"
            [plugin]
            name = "alerts"
            version = "1.4.0"
            type = "alert-sender"

            [dependencies]
            required = ["platform"]
            optional = ["jmx"]
        "#;
        let d = Descriptor::from_toml(toml).expect("descriptor should parse");
        assert_eq!(d.name, "alerts");
        assert_eq!(d.version.as_deref(), Some("1.4.0"));
        assert_eq!(d.type_tag.as_deref(), Some("alert-sender"));
        assert_eq!(d.required, vec!["platform"]);
        assert_eq!(d.optional, vec!["jmx"]);
    }

    #[test]
    fn test_dependencies_table_is_optional() {
        let d = Descriptor::from_toml("[plugin]\nname = \"platform\"\n")
            .expect("descriptor should parse");
        assert!(d.required.is_empty());
        assert!(d.optional.is_empty());
        assert!(d.version.is_none());
    }

    #[test]
    fn test_blank_name_rejected() {
        assert!(Descriptor::from_toml("[plugin]\nname = \"  \"\n").is_err());
        assert!(Descriptor::from_toml("[plugin]\nversion = \"1\"\n").is_err());
    }

    #[test]
    fn test_to_toml_parses_back() {
        let d = Descriptor::new("child")
            .with_version("2.0")
            .requires("platform")
            .optionally("parent");
        let back = Descriptor::from_toml(&d.to_toml()).expect("descriptor should parse");
        assert_eq!(back, d);
    }
}
