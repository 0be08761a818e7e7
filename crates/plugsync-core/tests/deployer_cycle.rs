mod support;

use std::sync::Arc;

use plugsync_core::descriptor::Descriptor;
use plugsync_core::store::MemoryStore;
use plugsync_core::types::{ArtifactKey, DeploymentClass};
use tempfile::TempDir;

use support::{CLASS, Host, calls, deployer, deployer_for, drop_jar, files_in, hash_of, seed};

#[test]
fn store_only_plugin_is_pulled_and_registered_with_refresh() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    let store = MemoryStore::new();
    let record = seed(&store, "p1.jar", &Descriptor::new("p1").with_version("1.0"), 1_000);
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");

    let report = d.scan_and_register().unwrap();

    assert_eq!(report.scan.reconcile.pulled.len(), 1);
    assert_eq!(files_in(&dir), vec!["p1.jar"]);
    assert_eq!(hash_of(&dir.join("p1.jar")), record.content_hash);
    assert_eq!(host.take(), calls(&[("p1", true)]));
    assert_eq!(host.reloads(), 1);
}

#[test]
fn second_cycle_without_changes_does_nothing() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    let store = MemoryStore::new();
    seed(&store, "p1.jar", &Descriptor::new("p1").with_version("1.0"), 1_000);
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");
    d.scan_and_register().unwrap();
    host.take();

    let report = d.scan_and_register().unwrap();

    assert!(report.scan.changes.is_empty());
    assert!(report.scan.reconcile.pulled.is_empty());
    assert_eq!(report.scan.reconcile.refreshed, vec![ArtifactKey::new("p1")]);
    assert_eq!(report.batch.attempted(), 0);
    assert!(host.take().is_empty());
    assert_eq!(host.reloads(), 1);
}

#[test]
fn older_local_copy_is_replaced_by_newer_store_version() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    drop_jar(&dir, "p1-old.jar", &Descriptor::new("p1").with_version("1.0"), 1_000);
    let store = MemoryStore::new();
    let record = seed(&store, "p1-new.jar", &Descriptor::new("p1").with_version("2.0"), 2_000);
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");

    d.scan_and_register().unwrap();

    assert_eq!(files_in(&dir), vec!["p1-new.jar"]);
    assert_eq!(hash_of(&dir.join("p1-new.jar")), record.content_hash);
    assert_eq!(host.take(), calls(&[("p1", true)]));
    let stored = store.record(CLASS, &ArtifactKey::new("p1")).unwrap();
    assert_eq!(stored.version.as_deref(), Some("2.0"));
}

#[test]
fn store_version_pulled_over_the_same_file_is_registered_as_pulled() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    drop_jar(&dir, "p1.jar", &Descriptor::new("p1").with_version("1.0"), 1_000);
    let store = MemoryStore::new();
    let record = seed(&store, "p1.jar", &Descriptor::new("p1").with_version("2.0"), 2_000);
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");

    let report = d.scan_and_register().unwrap();

    assert_eq!(report.scan.reconcile.pulled.len(), 1);
    assert!(report.batch.failed.is_empty());
    assert_eq!(host.take(), calls(&[("p1", true)]));
    assert_eq!(d.pending().count(), 0);
    let installed: Vec<_> = d.installed().collect();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].descriptor.version.as_deref(), Some("2.0"));
    assert_eq!(installed[0].content_hash, record.content_hash);
    assert_eq!(hash_of(&dir.join("p1.jar")), record.content_hash);
    let stored = store.record(CLASS, &ArtifactKey::new("p1")).unwrap();
    assert_eq!(stored.content_hash, record.content_hash);
}

#[test]
fn newer_local_copy_is_published_to_the_store() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    let local = drop_jar(&dir, "p1.jar", &Descriptor::new("p1").with_version("3.0"), 1_000);
    let store = MemoryStore::new();
    seed(&store, "p1.jar", &Descriptor::new("p1").with_version("2.0"), 5_000);
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");

    let report = d.scan_and_register().unwrap();

    assert_eq!(report.scan.reconcile.flagged_stale.len(), 1);
    assert_eq!(host.take(), calls(&[("p1", true)]));
    let stored = store.record(CLASS, &ArtifactKey::new("p1")).unwrap();
    assert_eq!(stored.version.as_deref(), Some("3.0"));
    assert_eq!(stored.content_hash, hash_of(&local));
}

#[test]
fn changed_plugin_refreshes_its_optional_dependents() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    drop_jar(&dir, "parent.jar", &Descriptor::new("parent").with_version("1.0"), 1_000);
    drop_jar(
        &dir,
        "child.jar",
        &Descriptor::new("child").with_version("1.0").optionally("parent"),
        1_000,
    );
    let store = MemoryStore::new();
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");
    d.scan_and_register().unwrap();
    assert_eq!(host.take(), calls(&[("parent", true), ("child", true)]));

    drop_jar(&dir, "parent.jar", &Descriptor::new("parent").with_version("1.1"), 5_000);
    let report = d.scan_and_register().unwrap();

    assert_eq!(report.scan.changes.updated.len(), 1);
    assert_eq!(host.take(), calls(&[("parent", true), ("child", true)]));
    assert_eq!(
        report.batch.forced,
        vec![ArtifactKey::new("parent"), ArtifactKey::new("child")]
    );
}

#[test]
fn plugin_with_missing_dependency_waits_until_it_arrives() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    drop_jar(&dir, "child.jar", &Descriptor::new("child").requires("base"), 1_000);
    let store = MemoryStore::new();
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");

    let first = d.scan_and_register().unwrap();
    assert_eq!(first.batch.pruned.len(), 1);
    assert_eq!(first.batch.pruned[0].to_string(), "child -> base (missing)");
    assert!(host.take().is_empty());
    assert_eq!(host.reloads(), 0);
    assert_eq!(d.pending().count(), 1);

    drop_jar(&dir, "base.jar", &Descriptor::new("base"), 2_000);
    d.scan_and_register().unwrap();

    assert_eq!(host.take(), calls(&[("base", true), ("child", true)]));
    assert_eq!(d.pending().count(), 0);
}

#[test]
fn dependency_cycle_is_registered_in_input_order() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    drop_jar(&dir, "a.jar", &Descriptor::new("a").requires("b"), 1_000);
    drop_jar(&dir, "b.jar", &Descriptor::new("b").requires("a"), 1_000);
    let store = MemoryStore::new();
    let host = Host::new();
    let mut d = deployer_for(DeploymentClass::Server, &dir, Arc::new(store.clone()), &host, "s1");

    let report = d.scan_and_register().unwrap();

    assert!(report.batch.pruned.is_empty());
    assert_eq!(host.take(), calls(&[("a", true), ("b", true)]));
}

#[test]
fn disabled_store_record_is_not_registered() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("agent-plugins");
    let store = MemoryStore::new();
    let mut record = seed(&store, "p1.jar", &Descriptor::new("p1"), 1_000);
    record.enabled = false;
    store
        .insert(record, Some(support::jar(&Descriptor::new("p1"))))
        .unwrap();
    drop_jar(&dir, "p1.jar", &Descriptor::new("p1").with_version("9.0"), 9_000);
    let host = Host::new();
    let mut d = deployer(&dir, Arc::new(store.clone()), &host, "s1");

    let report = d.scan_and_register().unwrap();

    assert_eq!(report.batch.skipped, vec![ArtifactKey::new("p1")]);
    assert!(host.take().is_empty());
    assert_eq!(d.pending().count(), 0);
}

#[test]
fn same_name_with_different_type_tags_registers_both() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("server-plugins");
    drop_jar(&dir, "x-a.jar", &Descriptor::new("x").with_type_tag("a"), 1_000);
    drop_jar(&dir, "x-b.jar", &Descriptor::new("x").with_type_tag("b"), 1_000);
    drop_jar(&dir, "user.jar", &Descriptor::new("user").requires("x"), 1_000);
    let store = MemoryStore::new();
    let host = Host::new();
    let mut d = deployer_for(DeploymentClass::Server, &dir, Arc::new(store.clone()), &host, "s1");

    let report = d.scan_and_register().unwrap();

    assert!(report.batch.pruned.is_empty());
    assert_eq!(
        report.batch.registered,
        vec![
            ArtifactKey::new("x").with_type_tag("a"),
            ArtifactKey::new("x").with_type_tag("b"),
            ArtifactKey::new("user"),
        ]
    );
    assert_eq!(d.pending().count(), 0);
    assert_eq!(d.installed().count(), 3);
    for tag in ["a", "b"] {
        let key = ArtifactKey::new("x").with_type_tag(tag);
        assert!(store.record(DeploymentClass::Server, &key).is_some());
    }

    let again = d.scan_and_register().unwrap();
    assert_eq!(again.batch.attempted(), 0);
}
