//! # Inventory Invariant Tests
//!
//! Exercises the snapshot/prune model at the data level: the snapshot built
//! from a stream matches exactly the stream's identities, orphans are the
//! set difference against the previous snapshot, and the finalizer path
//! equals pruning against an empty set.

use kustomize_controller::controller::reconciler::inventory::snapshot_from_stream;
use kustomize_controller::{ObjectIdentity, Snapshot};
use serde_json::json;

fn deployment(name: &str, namespace: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": namespace},
    })
}

fn service(name: &str, namespace: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": name, "namespace": namespace},
    })
}

#[test]
fn test_snapshot_matches_built_stream_exactly() {
    let stream = vec![
        deployment("backend", "dev"),
        service("backend", "dev"),
        json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "dev"}}),
    ];
    let snapshot = snapshot_from_stream(&stream, "abc");

    assert_eq!(snapshot.entries.len(), 3);
    assert!(snapshot.entries.contains(&ObjectIdentity {
        group: "apps".into(),
        version: "v1".into(),
        kind: "Deployment".into(),
        namespace: Some("dev".into()),
        name: "backend".into(),
    }));
    assert!(snapshot.entries.contains(&ObjectIdentity {
        group: "".into(),
        version: "v1".into(),
        kind: "Namespace".into(),
        namespace: None,
        name: "dev".into(),
    }));
}

#[test]
fn test_prune_on_removal_scenario() {
    // Reconcile #1 applies {Deployment A, Service A}.
    let first = snapshot_from_stream(&[deployment("a", "dev"), service("a", "dev")], "rev1");

    // The source drops Service A; reconcile #2 builds only Deployment A.
    let second = snapshot_from_stream(&[deployment("a", "dev")], "rev2");

    let orphans = first.diff(&second);
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].kind, "Service");
    assert_eq!(orphans[0].name, "a");

    // The new snapshot contains exactly the surviving Deployment.
    assert_eq!(second.entries.len(), 1);
    assert_eq!(second.entries[0].kind, "Deployment");
}

#[test]
fn test_unchanged_stream_produces_no_orphans() {
    let first = snapshot_from_stream(&[deployment("a", "dev"), service("a", "dev")], "rev1");
    let second = snapshot_from_stream(&[service("a", "dev"), deployment("a", "dev")], "rev1");
    // Ordering in the stream does not matter for identity diffing.
    assert!(first.diff(&second).is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_finalizer_equals_prune_against_empty_set() {
    let snapshot = snapshot_from_stream(&[deployment("a", "dev"), service("a", "dev")], "rev1");
    let empty = Snapshot::new(String::new(), Vec::new());

    let orphans = snapshot.diff(&empty);
    assert_eq!(orphans.len(), snapshot.entries.len());
    for entry in &snapshot.entries {
        assert!(orphans.contains(entry));
    }
}

#[test]
fn test_snapshot_distinguishes_namespaces() {
    let dev = snapshot_from_stream(&[deployment("a", "dev")], "r");
    let prod = snapshot_from_stream(&[deployment("a", "prod")], "r");
    assert_eq!(dev.diff(&prod).len(), 1);
}

#[test]
fn test_snapshot_serialization_round_trip() {
    let snapshot = snapshot_from_stream(&[deployment("a", "dev"), service("a", "dev")], "rev1");
    let yaml = serde_yaml::to_string(&snapshot).unwrap();
    let restored: Snapshot = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(snapshot, restored);
}
