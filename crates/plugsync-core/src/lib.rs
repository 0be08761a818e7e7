//! Plugsync Core Library
//!
//! Keeps plugin deployment directories on every server of a cluster in line
//! with a shared artifact store, and registers changed plugins in dependency
//! order.

pub mod admin;
pub mod cache;
pub mod config;
pub mod deletion;
pub mod deployer;
pub mod descriptor;
pub mod error;
pub mod fs;
pub mod graph;
pub mod obsolescence;
pub mod registration;
pub mod scanner;
pub mod schedule;
pub mod store;
pub mod sync;
pub mod types;
pub mod version;

pub use error::{Result, SyncError};

/// Re-exports of commonly used types
pub mod prelude {
    // Data model
    pub use crate::error::{Result, SyncError};
    pub use crate::types::{ArtifactKey, ArtifactRecord, ArtifactStatus, DeploymentClass};
    pub use crate::version::PluginVersion;

    // Descriptors
    pub use crate::descriptor::{ArchiveDescriptorParser, Descriptor, DescriptorParser};

    // Store
    pub use crate::store::{ArtifactStore, ContentUpdate, FileStore, MemoryStore};

    // Deployment
    pub use crate::deployer::{Collaborators, CycleReport, PluginDeployer, ScanCycle};
    pub use crate::registration::{
        AdminIdentity, FacetReloader, Identity, IdentityProvider, Registrar,
    };
    pub use crate::scanner::RetryPolicy;
    pub use crate::schedule::{ScanScheduler, SchedulerHandle};

    // Graph and admin
    pub use crate::admin::PluginAdmin;
    pub use crate::graph::{DependencyGraph, DescriptorNode};

    // Configuration
    pub use crate::config::PlugsyncConfig;
}
