//! # Build
//!
//! Renders the tree at `scratch/<spec.path>` into an ordered stream of
//! Kubernetes objects. Synthesizes a default kustomization manifest when the
//! root has none, runs `kustomize build`, then post-processes the stream:
//! identity labels when pruning is on, namespace overrides, and the content
//! checksum over the canonicalized stream.

use crate::constants;
use crate::crd::Kustomization;
use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Kinds that exist outside any namespace. Everything else gets a namespace
/// defaulted at build time so inventory identities are stable.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
    "RuntimeClass",
    "PersistentVolume",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "APIService",
];

/// Result of rendering the tree: the ordered object stream plus the content
/// checksum used for the identity label and the snapshot.
#[derive(Debug)]
pub struct BuildResult {
    pub objects: Vec<Value>,
    pub checksum: String,
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Render `scratch/<spec.path>` into the object stream.
pub async fn build_manifests(ks: &Kustomization, source_root: &Path) -> Result<BuildResult> {
    let build_root = resolve_build_root(source_root, &ks.spec.path)?;

    ensure_kustomization_file(&build_root).await?;

    let yaml = run_kustomize_build(&build_root).await?;

    let mut objects = parse_manifest_stream(&yaml)?;
    if objects.is_empty() {
        return Err(anyhow::anyhow!(
            "build of '{}' produced no objects",
            ks.spec.path
        ));
    }

    postprocess_stream(ks, &mut objects)?;

    // The checksum is computed after label injection so it covers exactly
    // what will be applied, except the checksum label itself.
    let checksum = stream_checksum(&objects);
    if ks.spec.prune {
        for obj in &mut objects {
            set_label(obj, constants::CHECKSUM_LABEL, &checksum)?;
        }
    }

    info!(
        "built {} object(s) from '{}' (checksum: {})",
        objects.len(),
        ks.spec.path,
        checksum
    );
    Ok(BuildResult { objects, checksum })
}

/// Join `spec.path` onto the unpacked source root. The spec guarantees the
/// path is `./`-rooted and traversal-free by the time the build runs.
fn resolve_build_root(source_root: &Path, spec_path: &str) -> Result<PathBuf> {
    let relative = spec_path.trim_start_matches("./");
    let root = if relative.is_empty() {
        source_root.to_path_buf()
    } else {
        source_root.join(relative)
    };
    if !root.is_dir() {
        return Err(anyhow::anyhow!(
            "path '{spec_path}' does not exist in the source artifact"
        ));
    }
    Ok(root)
}

/// If the build root has no kustomization manifest, synthesize one listing
/// every YAML file under the root in deterministic lexicographic order.
pub async fn ensure_kustomization_file(root: &Path) -> Result<()> {
    for name in ["kustomization.yaml", "kustomization.yml"] {
        if root.join(name).is_file() {
            debug!("using existing {} at {}", name, root.display());
            return Ok(());
        }
    }

    let resources = list_yaml_resources(root)?;
    if resources.is_empty() {
        return Err(anyhow::anyhow!(
            "no kustomization manifest and no YAML resources under {}",
            root.display()
        ));
    }

    let mut manifest = String::from(
        "apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nresources:\n",
    );
    for resource in &resources {
        manifest.push_str(&format!("  - {resource}\n"));
    }

    tokio::fs::write(root.join("kustomization.yaml"), &manifest)
        .await
        .context("failed to write synthesized kustomization.yaml")?;
    debug!(
        "synthesized kustomization.yaml with {} resource(s)",
        resources.len()
    );
    Ok(())
}

/// Every `*.yaml`/`*.yml` under the root, recursive, lexicographic, as
/// root-relative paths.
fn list_yaml_resources(root: &Path) -> Result<Vec<String>> {
    let mut resources = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                let relative = path
                    .strip_prefix(root)
                    .expect("walk stays under the root")
                    .to_string_lossy()
                    .to_string();
                resources.push(relative);
            }
        }
    }
    resources.sort();
    Ok(resources)
}

/// Run `kustomize build` on the given root and return the rendered YAML.
async fn run_kustomize_build(root: &Path) -> Result<String> {
    let output = tokio::process::Command::new("kustomize")
        .arg("build")
        .arg(root)
        .output()
        .await
        .context("failed to execute kustomize build")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("kustomize build failed: {stderr}"));
    }

    String::from_utf8(output.stdout).context("kustomize output is not valid UTF-8")
}

/// Parse a multi-document YAML stream into ordered JSON objects, dropping
/// empty documents.
pub fn parse_manifest_stream(yaml: &str) -> Result<Vec<Value>> {
    use serde::Deserialize;

    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value =
            Value::deserialize(document).context("failed to parse manifest document")?;
        if value.is_null() {
            continue;
        }
        objects.push(value);
    }
    Ok(objects)
}

/// Inject identity labels (prune on), apply the target-namespace override,
/// and default the namespace of namespaced objects.
fn postprocess_stream(ks: &Kustomization, objects: &mut [Value]) -> Result<()> {
    let name = ks.metadata.name.as_deref().unwrap_or_default();
    let namespace = ks.metadata.namespace.as_deref().unwrap_or("default");

    for obj in objects.iter_mut() {
        let kind = obj
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();

        if !is_cluster_scoped(&kind) {
            if let Some(target) = &ks.spec.target_namespace {
                set_namespace(obj, target)?;
            } else if obj.pointer("/metadata/namespace").is_none() {
                set_namespace(obj, namespace)?;
            }
        }

        if ks.spec.prune {
            set_label(obj, constants::NAME_LABEL, name)?;
            set_label(obj, constants::NAMESPACE_LABEL, namespace)?;
        }
    }
    Ok(())
}

/// Checksum of the canonicalized stream: SHA-256 over the JSON serialization
/// of each object in order. serde_json serializes map keys sorted, so the
/// digest is deterministic for identical content. The value is truncated to
/// 40 hex characters to stay within the 63-char label value limit.
pub fn stream_checksum(objects: &[Value]) -> String {
    let mut hasher = Sha256::new();
    for obj in objects {
        hasher.update(obj.to_string().as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..40].to_string()
}

fn set_label(obj: &mut Value, key: &str, value: &str) -> Result<()> {
    let metadata = obj
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("manifest document is not an object"))?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    let labels = metadata
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("metadata is not an object"))?
        .entry("labels")
        .or_insert_with(|| Value::Object(Default::default()));
    labels
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("metadata.labels is not an object"))?
        .insert(key.to_string(), Value::String(value.to_string()));
    Ok(())
}

fn set_namespace(obj: &mut Value, namespace: &str) -> Result<()> {
    let metadata = obj
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("manifest document is not an object"))?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    metadata
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("metadata is not an object"))?
        .insert(
            "namespace".to_string(),
            Value::String(namespace.to_string()),
        );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kustomization(prune: bool, target_namespace: Option<&str>) -> Kustomization {
        let mut ks: Kustomization = serde_yaml::from_str(
            r#"
apiVersion: kustomize.toolkit.fluxcd.io/v1beta1
kind: Kustomization
metadata:
  name: backend
  namespace: dev
spec:
  sourceRef:
    name: webapp
  path: ./apps
  interval: 5m
"#,
        )
        .unwrap();
        ks.spec.prune = prune;
        ks.spec.target_namespace = target_namespace.map(str::to_string);
        ks
    }

    #[test]
    fn test_parse_manifest_stream_orders_and_skips_empty_docs() {
        let yaml = "---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: dev\n---\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n";
        let objects = parse_manifest_stream(yaml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["kind"], "Namespace");
        assert_eq!(objects[1]["kind"], "Service");
    }

    #[test]
    fn test_postprocess_injects_identity_labels_on_every_object() {
        let ks = kustomization(true, None);
        let mut objects = vec![
            json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "a", "namespace": "dev"}}),
            json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "b", "namespace": "dev"}}),
        ];
        postprocess_stream(&ks, &mut objects).unwrap();
        for obj in &objects {
            assert_eq!(
                obj.pointer("/metadata/labels")
                    .unwrap()
                    .get(constants::NAME_LABEL)
                    .and_then(|v| v.as_str()),
                Some("backend")
            );
            assert_eq!(
                obj.pointer("/metadata/labels")
                    .unwrap()
                    .get(constants::NAMESPACE_LABEL)
                    .and_then(|v| v.as_str()),
                Some("dev")
            );
        }
    }

    #[test]
    fn test_postprocess_without_prune_adds_no_labels() {
        let ks = kustomization(false, None);
        let mut objects = vec![
            json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "b", "namespace": "dev"}}),
        ];
        postprocess_stream(&ks, &mut objects).unwrap();
        assert!(objects[0].pointer("/metadata/labels").is_none());
    }

    #[test]
    fn test_postprocess_applies_target_namespace_to_namespaced_kinds_only() {
        let ks = kustomization(false, Some("prod"));
        let mut objects = vec![
            json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "svc", "namespace": "dev"}}),
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "dev"}}),
        ];
        postprocess_stream(&ks, &mut objects).unwrap();
        assert_eq!(
            objects[0].pointer("/metadata/namespace").unwrap(),
            &json!("prod")
        );
        assert!(objects[1].pointer("/metadata/namespace").is_none());
    }

    #[test]
    fn test_postprocess_defaults_missing_namespace() {
        let ks = kustomization(false, None);
        let mut objects = vec![
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}}),
        ];
        postprocess_stream(&ks, &mut objects).unwrap();
        assert_eq!(
            objects[0].pointer("/metadata/namespace").unwrap(),
            &json!("dev")
        );
    }

    #[test]
    fn test_stream_checksum_is_deterministic_and_content_sensitive() {
        let a = vec![json!({"kind": "Service", "metadata": {"name": "a"}})];
        let b = vec![json!({"kind": "Service", "metadata": {"name": "a"}})];
        let c = vec![json!({"kind": "Service", "metadata": {"name": "c"}})];
        assert_eq!(stream_checksum(&a), stream_checksum(&b));
        assert_ne!(stream_checksum(&a), stream_checksum(&c));
        assert_eq!(stream_checksum(&a).len(), 40);
    }

    #[test]
    fn test_stream_checksum_depends_on_order() {
        let svc = json!({"kind": "Service", "metadata": {"name": "a"}});
        let dep = json!({"kind": "Deployment", "metadata": {"name": "a"}});
        assert_ne!(
            stream_checksum(&[svc.clone(), dep.clone()]),
            stream_checksum(&[dep, svc])
        );
    }

    #[tokio::test]
    async fn test_synthesized_kustomization_lists_resources_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "kind: Service\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.yaml"), "kind: Service\n").unwrap();
        std::fs::write(dir.path().join("a.yml"), "kind: Service\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        ensure_kustomization_file(dir.path()).await.unwrap();
        let manifest = std::fs::read_to_string(dir.path().join("kustomization.yaml")).unwrap();
        let positions: Vec<usize> = ["a.yml", "b.yaml", "sub/a.yaml"]
            .iter()
            .map(|r| manifest.find(r).unwrap())
            .collect();
        assert!(positions[0] < positions[1] && positions[1] < positions[2]);
        assert!(!manifest.contains("notes.txt"));
    }

    #[tokio::test]
    async fn test_existing_kustomization_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let original = "resources:\n  - only-this.yaml\n";
        std::fs::write(dir.path().join("kustomization.yaml"), original).unwrap();
        std::fs::write(dir.path().join("other.yaml"), "kind: Service\n").unwrap();

        ensure_kustomization_file(dir.path()).await.unwrap();
        let after = std::fs::read_to_string(dir.path().join("kustomization.yaml")).unwrap();
        assert_eq!(after, original);
    }

    #[tokio::test]
    async fn test_empty_tree_without_kustomization_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_kustomization_file(dir.path()).await.is_err());
    }
}
