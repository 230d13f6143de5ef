//! # Builder Tests
//!
//! The builder must be deterministic: identical inputs produce identical
//! streams and identical checksums. These tests cover the pure parts —
//! manifest-stream parsing, overlay synthesis, and the content checksum —
//! without requiring the kustomize binary.

use kustomize_controller::controller::reconciler::build::{
    ensure_kustomization_file, parse_manifest_stream, stream_checksum,
};
use serde_json::json;

#[test]
fn test_parse_preserves_document_order() {
    let yaml = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: dev
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: backend
  namespace: dev
---
apiVersion: v1
kind: Service
metadata:
  name: backend
  namespace: dev
"#;
    let objects = parse_manifest_stream(yaml).unwrap();
    let kinds: Vec<&str> = objects
        .iter()
        .map(|o| o["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["Namespace", "Deployment", "Service"]);
}

#[test]
fn test_parse_rejects_malformed_yaml() {
    assert!(parse_manifest_stream("kind: [unclosed").is_err());
}

#[test]
fn test_checksum_changes_iff_content_changes() {
    let base = vec![
        json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "a", "namespace": "dev"}}),
    ];
    let same = base.clone();
    let mut changed = base.clone();
    changed[0]["metadata"]["labels"] = json!({"tier": "web"});

    assert_eq!(stream_checksum(&base), stream_checksum(&same));
    assert_ne!(stream_checksum(&base), stream_checksum(&changed));
}

#[test]
fn test_checksum_is_label_safe() {
    let objects = vec![json!({"kind": "Service"})];
    let checksum = stream_checksum(&objects);
    assert!(checksum.len() <= 63);
    assert!(checksum.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_synthesized_overlay_is_stable_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("z.yaml"), "kind: Service\n").unwrap();
    std::fs::write(dir.path().join("a.yaml"), "kind: Service\n").unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    std::fs::write(dir.path().join("nested/m.yml"), "kind: Service\n").unwrap();

    ensure_kustomization_file(dir.path()).await.unwrap();
    let first = std::fs::read_to_string(dir.path().join("kustomization.yaml")).unwrap();

    // A second run must leave the synthesized manifest untouched.
    ensure_kustomization_file(dir.path()).await.unwrap();
    let second = std::fs::read_to_string(dir.path().join("kustomization.yaml")).unwrap();
    assert_eq!(first, second);

    // And the listing is lexicographic.
    let a = first.find("a.yaml").unwrap();
    let m = first.find("nested/m.yml").unwrap();
    let z = first.find("z.yaml").unwrap();
    assert!(a < m && m < z);
}

#[tokio::test]
async fn test_user_kustomization_wins_over_synthesis() {
    let dir = tempfile::tempdir().unwrap();
    let user_manifest = "apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nresources:\n  - picked.yaml\n";
    std::fs::write(dir.path().join("kustomization.yaml"), user_manifest).unwrap();
    std::fs::write(dir.path().join("ignored.yaml"), "kind: Service\n").unwrap();

    ensure_kustomization_file(dir.path()).await.unwrap();
    let after = std::fs::read_to_string(dir.path().join("kustomization.yaml")).unwrap();
    assert_eq!(after, user_manifest);
}
