//! Plugsync - plugin deployment reconciliation
//!
//! Usage:
//!   plugsync scan               # Reconcile the plugin directory once
//!   plugsync register           # Reconcile and register changed plugins
//!   plugsync watch              # Run both deployers on their schedule
//!   plugsync status             # Show store records
//!   plugsync disable <name>...  # Admin operations with dependency checks

mod host;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plugsync_core::admin::PluginAdmin;
use plugsync_core::config::{PlugsyncConfig, load_config};
use plugsync_core::deployer::{Collaborators, CycleReport, PluginDeployer, ScanOutcome};
use plugsync_core::descriptor::ArchiveDescriptorParser;
use plugsync_core::registration::AdminIdentity;
use plugsync_core::schedule::ScanScheduler;
use plugsync_core::store::{ArtifactStore, FileStore};
use plugsync_core::types::{ArtifactRecord, DeploymentClass};

use crate::host::{LoggingRegistrar, NoopReloader};

#[derive(Parser)]
#[command(name = "plugsync")]
#[command(about = "Plugin deployment reconciliation", long_about = None)]
struct Cli {
    /// Path to plugsync.toml
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Deployment class to operate on
    #[arg(long, global = true, default_value = "agent")]
    class: ClassArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the plugin directory with the store once
    Scan,

    /// Reconcile, then register changed plugins in dependency order
    Register,

    /// Run agent and server deployers periodically until interrupted
    Watch {
        /// Override the configured scan period, in seconds
        #[arg(long)]
        period: Option<u64>,
    },

    /// Show store records for the class
    Status {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Enable plugins; every dependency must be enabled or listed too
    Enable { names: Vec<String> },

    /// Disable plugins; every dependent must be disabled or listed too
    Disable { names: Vec<String> },

    /// Delete plugins cluster-wide; enabled dependents must be listed too
    #[command(alias = "rm")]
    Delete { names: Vec<String> },
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassArg {
    Agent,
    Server,
}

impl From<ClassArg> for DeploymentClass {
    fn from(arg: ClassArg) -> Self {
        match arg {
            ClassArg::Agent => DeploymentClass::Agent,
            ClassArg::Server => DeploymentClass::Server,
        }
    }
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plugsync=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let class = DeploymentClass::from(cli.class);

    let store: Arc<dyn ArtifactStore> = Arc::new(
        FileStore::open(config.store_dir())
            .with_context(|| format!("Failed to open store at {}", config.store_dir().display()))?,
    );
    store
        .register_server(&config.server_id)
        .context("Failed to register this server with the store")?;

    match cli.command {
        Commands::Scan => {
            let outcome = deployer(&config, class, store).scan()?;
            print_scan(class, &outcome);
        }
        Commands::Register => {
            let report = deployer(&config, class, store).scan_and_register()?;
            print_cycle(class, &report);
        }
        Commands::Watch { period } => run_watch(&config, store, period)?,
        Commands::Status { format } => run_status(class, store.as_ref(), format)?,
        Commands::Enable { names } => {
            let admin = PluginAdmin::new(class, store);
            let graph = admin.load_graph(&ArchiveDescriptorParser::new())?;
            admin.enable(&graph, &names)?;
            println!("Enabled: {}", names.join(", "));
        }
        Commands::Disable { names } => {
            let admin = PluginAdmin::new(class, store);
            let graph = admin.load_graph(&ArchiveDescriptorParser::new())?;
            admin.disable(&graph, &names)?;
            println!("Disabled: {}", names.join(", "));
        }
        Commands::Delete { names } => {
            let admin = PluginAdmin::new(class, store);
            let graph = admin.load_graph(&ArchiveDescriptorParser::new())?;
            admin.delete(&graph, &names)?;
            println!(
                "Deleted: {} (servers remove their copies on their next scan)",
                names.join(", ")
            );
        }
    }

    Ok(())
}

fn deployer(
    config: &PlugsyncConfig,
    class: DeploymentClass,
    store: Arc<dyn ArtifactStore>,
) -> PluginDeployer {
    let collaborators = Collaborators {
        store,
        parser: Arc::new(ArchiveDescriptorParser::new()),
        registrar: Arc::new(LoggingRegistrar),
        reloader: Arc::new(NoopReloader),
        identity: Arc::new(AdminIdentity::default()),
    };
    PluginDeployer::new(
        class,
        config.plugin_dir(class),
        config.server_id.clone(),
        collaborators,
    )
    .with_scan_period(config.scan_period())
    .with_retry(config.retry.into())
    .with_extensions(config.extensions.iter().cloned())
}

fn run_watch(config: &PlugsyncConfig, store: Arc<dyn ArtifactStore>, period: Option<u64>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async {
        let mut handles = Vec::new();
        for class in [DeploymentClass::Agent, DeploymentClass::Server] {
            let mut deployer = deployer(config, class, store.clone());
            if let Some(secs) = period {
                deployer.set_scan_period(std::time::Duration::from_secs(secs));
            }
            info!(
                "Watching {} every {:?}",
                deployer.plugin_dir().display(),
                deployer.scan_period()
            );
            handles.push(ScanScheduler::spawn(deployer));
        }

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for interrupt")?;
        info!("Interrupted, finishing in-flight scans");
        for handle in handles {
            handle.shutdown().await;
        }
        Ok(())
    })
}

fn run_status(class: DeploymentClass, store: &dyn ArtifactStore, format: OutputFormat) -> Result<()> {
    let mut records = store.list_records(class)?;
    records.extend(store.list_deleted(class)?);
    records.sort_by(|a, b| a.name.cmp(&b.name));
    records.dedup_by(|a, b| a.key() == b.key());

    match format {
        OutputFormat::Table => print_table(class, &records),
        OutputFormat::Json => {
            let output = serde_json::json!({
                "schema_version": 1,
                "class": class,
                "records": records,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

fn print_table(class: DeploymentClass, records: &[ArtifactRecord]) {
    if records.is_empty() {
        println!("No {} plugins in the store.", class);
        return;
    }

    println!("{} plugins ({}):", class, records.len());
    println!(
        "  {:<24} {:<12} {:<8} {:<16} {:<20} FILE",
        "NAME", "VERSION", "ENABLED", "STATUS", "MODIFIED"
    );
    for r in records {
        println!(
            "  {:<24} {:<12} {:<8} {:<16} {:<20} {}",
            r.key().to_string(),
            r.version.as_deref().unwrap_or("-"),
            if r.enabled { "yes" } else { "no" },
            format!("{:?}", r.status),
            format_millis(r.mtime),
            r.path
        );
    }
}

fn format_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .filter(|&m| m > 0)
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_scan(class: DeploymentClass, outcome: &ScanOutcome) {
    let changes = &outcome.changes;
    let sync = &outcome.reconcile;
    println!(
        "{}: {} added, {} updated, {} removed, {} duplicates removed",
        class,
        changes.added.len(),
        changes.updated.len(),
        changes.removed_obsolete.len(),
        changes.duplicates_removed.len()
    );
    println!(
        "store: {} pulled, {} pushed, {} stale, {} disabled, {} failed",
        sync.pulled.len(),
        sync.pushed.len(),
        sync.flagged_stale.len(),
        sync.disabled.len(),
        sync.failed.len()
    );
    if !outcome.deletion.deleted_files.is_empty() {
        println!("deleted: {}", display_paths(&outcome.deletion.deleted_files));
    }
    println!("{} pending registration", outcome.pending);
}

fn print_cycle(class: DeploymentClass, report: &CycleReport) {
    print_scan(class, &report.scan);
    let batch = &report.batch;
    if batch.attempted() == 0 && batch.pruned.is_empty() {
        println!("Nothing to register.");
        return;
    }
    println!(
        "registered: {} ({} forced)",
        batch
            .registered
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        batch.forced.len()
    );
    for pruned in &batch.pruned {
        println!("  not registered: {}", pruned);
    }
    for (key, err) in &batch.failed {
        println!("  failed: {}: {}", key, err);
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.file_name().map(Path::new).unwrap_or(p.as_path()).display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
