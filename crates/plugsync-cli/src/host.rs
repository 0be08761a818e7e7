//! Stand-in host services for running the deployer outside a plugin container.

use std::path::Path;

use plugsync_core::descriptor::Descriptor;
use plugsync_core::registration::{FacetReloader, Identity, Registrar};
use tracing::{debug, info};

/// Accepts every plugin and logs what a container would have loaded.
pub struct LoggingRegistrar;

impl Registrar for LoggingRegistrar {
    fn register(&self, descriptor: &Descriptor, file: &Path, force: bool) -> anyhow::Result<()> {
        info!(
            "Loaded {} {} from {}{}",
            descriptor.name,
            descriptor.version.as_deref().unwrap_or("(unversioned)"),
            file.display(),
            if force { " [refresh]" } else { "" }
        );
        Ok(())
    }
}

pub struct NoopReloader;

impl FacetReloader for NoopReloader {
    fn reload(&self, identity: &Identity) -> anyhow::Result<()> {
        debug!("Type facets reloaded as {}", identity.name);
        Ok(())
    }
}
