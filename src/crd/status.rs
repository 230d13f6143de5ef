//! # Status Types
//!
//! Status sub-resource of the Kustomization CRD: the Ready condition with
//! its reason codes, revision bookkeeping, and the inventory snapshot that
//! drives pruning.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reason codes carried by the Ready condition. The reason always matches
/// the event reason emitted for the same outcome.
pub mod reasons {
    /// Steady state: the last reconciliation applied cleanly.
    pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
    /// The apply stage failed, or another error without a dedicated reason.
    pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";
    /// A reconciliation is in flight.
    pub const PROGRESSING: &str = "Progressing";
    /// spec.suspend is true.
    pub const SUSPENDED: &str = "Suspended";
    /// A dependsOn target is missing or not Ready.
    pub const DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
    /// Orphan deletion failed.
    pub const PRUNE_FAILED: &str = "PruneFailed";
    /// Source lookup, download, checksum or unpack failed.
    pub const ARTIFACT_FAILED: &str = "ArtifactFailed";
    /// Decrypting or rendering the tree failed.
    pub const BUILD_FAILED: &str = "BuildFailed";
    /// A health check did not reach readiness within the deadline.
    pub const HEALTH_CHECK_FAILED: &str = "HealthCheckFailed";
    /// Spec admission checks or manifest validation failed.
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Status of the Kustomization resource. Controller-owned; the spec is
/// user-owned.
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationStatus {
    /// Generation observed by the last reconciliation attempt.
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Conditions represent the latest available observations. Only `Ready`
    /// is defined.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Revision of the last successfully applied artifact. Never rolled back
    /// on failure.
    #[serde(default)]
    pub last_applied_revision: Option<String>,
    /// Revision of the last reconciliation attempt, successful or not.
    #[serde(default)]
    pub last_attempted_revision: Option<String>,
    /// Value of the on-demand trigger annotation last consumed. Comparing
    /// this to the annotation decides whether a forced run is due.
    #[serde(default)]
    pub last_handled_reconcile_at: Option<String>,
    /// Inventory of objects applied by the last successful reconciliation.
    /// Sole source of truth for pruning; survives controller restarts.
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
}

/// Condition of a Kustomization.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition (True, False, Unknown).
    pub status: String,
    /// Last time the condition status changed.
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable reason for the condition.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message describing the condition.
    #[serde(default)]
    pub message: Option<String>,
}

/// Inventory of the last successful reconciliation: the set of applied
/// object identities plus the content checksum of the built stream.
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Checksum of the canonicalized built manifest stream.
    pub checksum: String,
    /// Identities of every applied object, sorted for deterministic
    /// serialization.
    #[serde(default)]
    pub entries: Vec<ObjectIdentity>,
}

/// Identity of an applied object: (group, version, kind, namespace, name).
#[derive(
    Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentity {
    /// API group; empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Kind of the object.
    pub kind: String,
    /// Namespace; absent for cluster-scoped objects.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Name of the object.
    pub name: String,
}

impl ObjectIdentity {
    /// Display form `<kind>.<group>/<namespace>/<name>` used in logs and
    /// event messages.
    pub fn display(&self) -> String {
        let group = if self.group.is_empty() {
            "v1".to_string()
        } else {
            self.group.clone()
        };
        match &self.namespace {
            Some(ns) => format!("{}.{}/{}/{}", self.kind, group, ns, self.name),
            None => format!("{}.{}/{}", self.kind, group, self.name),
        }
    }
}

impl Snapshot {
    /// Build a snapshot from object identities, sorting entries so two
    /// snapshots over the same set compare equal.
    pub fn new(checksum: String, mut entries: Vec<ObjectIdentity>) -> Self {
        entries.sort();
        entries.dedup();
        Self { checksum, entries }
    }

    /// Identities present in `self` but absent from `other`: the orphans to
    /// prune after `other` was applied.
    pub fn diff(&self, other: &Snapshot) -> Vec<ObjectIdentity> {
        self.entries
            .iter()
            .filter(|id| !other.entries.contains(id))
            .cloned()
            .collect()
    }
}
