//! # Custom Resource Definitions
//!
//! CRD types for the Kustomize Controller.
//!
//! A `Kustomization` declares where a bundle of Kubernetes manifests lives
//! (a source artifact produced by the source service), how to render it,
//! where to apply it, and how to verify it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod status;

pub use status::{Condition, KustomizationStatus, ObjectIdentity, Snapshot};

/// Kustomization Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: kustomize.toolkit.fluxcd.io/v1beta1
/// kind: Kustomization
/// metadata:
///   name: backend
///   namespace: dev
/// spec:
///   sourceRef:
///     kind: GitRepository
///     name: webapp
///   path: ./webapp/backend
///   interval: 5m
///   prune: true
///   dependsOn:
///     - name: common
///   healthChecks:
///     - apiVersion: apps/v1
///       kind: Deployment
///       name: backend
///       namespace: dev
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Kustomization",
    group = "kustomize.toolkit.fluxcd.io",
    version = "v1beta1",
    namespaced,
    status = "KustomizationStatus",
    shortname = "ks",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}, {"name":"Revision", "type":"string", "jsonPath":".status.lastAppliedRevision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Reference to the source object that produces the manifest artifact.
    pub source_ref: CrossNamespaceSourceReference,
    /// Path within the source artifact to the directory containing the
    /// kustomization root. Must begin with `./`.
    #[serde(default = "default_path")]
    pub path: String,
    /// How often to reconcile the Kustomization.
    /// Format: Kubernetes duration string (e.g., "5m", "1h").
    /// Minimum: 1m (60 seconds).
    pub interval: String,
    /// Wall-clock budget for a single reconciliation (fetch, build,
    /// validate, apply, prune, health checks). Defaults to `interval`.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Suspend reconciliation. While true, all triggers are ignored except
    /// spec edits that clear it.
    #[serde(default)]
    pub suspend: bool,
    /// Enable garbage collection of objects that were applied by a previous
    /// reconciliation but are absent from the current build.
    #[serde(default)]
    pub prune: bool,
    /// Kustomizations that must be Ready before this one reconciles.
    #[serde(default)]
    pub depends_on: Vec<CrossNamespaceDependencyReference>,
    /// Objects to wait on after apply; the reconciliation succeeds only once
    /// each reports ready.
    #[serde(default)]
    pub health_checks: Vec<CrossNamespaceObjectReference>,
    /// Decryption configuration for SOPS-encrypted files in the artifact.
    #[serde(default)]
    pub decryption: Option<Decryption>,
    /// Service account to impersonate when applying to the target cluster.
    #[serde(default)]
    pub service_account: Option<ServiceAccountReference>,
    /// Kubeconfig for applying to a remote cluster. When set, all apply,
    /// prune and health-check operations target that cluster.
    #[serde(default)]
    pub kube_config: Option<KubeConfigReference>,
    /// Namespace to set on every namespaced object in the build output.
    #[serde(default)]
    pub target_namespace: Option<String>,
    /// Validation mode for the built manifests: "none", "client" or
    /// "server" (dry-run against the target API server).
    #[serde(default = "default_validation")]
    pub validation: String,
}

/// Reference to a source artifact producer, e.g. a FluxCD GitRepository.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceSourceReference {
    /// Source kind (default: GitRepository).
    #[serde(default = "default_source_kind")]
    pub kind: String,
    /// Source name.
    pub name: String,
    /// Source namespace; defaults to the Kustomization's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Reference to another Kustomization that must be Ready first.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceDependencyReference {
    /// Dependency namespace; defaults to the Kustomization's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Dependency name.
    pub name: String,
}

/// Fully qualified reference to a cluster object for health assessment.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceObjectReference {
    /// API version of the referent, e.g. "apps/v1".
    pub api_version: String,
    /// Kind of the referent, e.g. "Deployment".
    pub kind: String,
    /// Namespace of the referent; defaults to the Kustomization's namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Name of the referent.
    pub name: String,
}

/// Decryption configuration.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Decryption {
    /// Decryption provider. Only "sops" is supported.
    pub provider: String,
    /// Secret in the Kustomization's namespace holding the private keys.
    /// Every data value is treated as a candidate key.
    #[serde(default)]
    pub secret_ref: Option<LocalObjectReference>,
}

/// Service account to impersonate while applying.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountReference {
    /// Namespace of the service account; defaults to the Kustomization's
    /// namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Name of the service account.
    pub name: String,
}

/// Kubeconfig for remote-cluster mode.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigReference {
    /// Secret in the Kustomization's namespace whose `value` key holds a
    /// self-contained kubeconfig (no exec plugins, no file paths).
    pub secret_ref: LocalObjectReference,
}

/// Reference to a secret in the same namespace.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referent.
    pub name: String,
}

fn default_source_kind() -> String {
    "GitRepository".to_string()
}

fn default_path() -> String {
    "./".to_string()
}

fn default_validation() -> String {
    "client".to_string()
}

impl Kustomization {
    /// Reconcile interval. Callers must have validated the spec; an
    /// unparseable interval falls back to a fixed requeue rather than
    /// panicking in the hot path.
    pub fn interval(&self) -> Duration {
        crate::controller::reconciler::validate::parse_kubernetes_duration(&self.spec.interval)
            .unwrap_or(Duration::from_secs(crate::constants::FALLBACK_REQUEUE_SECS))
    }

    /// Wall-clock budget for one reconciliation; defaults to the interval.
    pub fn timeout(&self) -> Duration {
        self.spec
            .timeout
            .as_deref()
            .and_then(|t| {
                crate::controller::reconciler::validate::parse_kubernetes_duration(t).ok()
            })
            .unwrap_or_else(|| self.interval())
    }

    /// Namespace the sourceRef resolves against.
    pub fn source_namespace(&self) -> String {
        self.spec
            .source_ref
            .namespace
            .clone()
            .or_else(|| self.metadata.namespace.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// The value of the on-demand trigger annotation, if any.
    pub fn requested_at(&self) -> Option<String> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::constants::RECONCILE_AT_ANNOTATION))
            .cloned()
    }
}
