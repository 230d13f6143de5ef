//! # Status Management
//!
//! Writes the Kustomization status sub-resource: the Ready condition,
//! revision bookkeeping, the consumed trigger annotation value, and the
//! inventory snapshot. The snapshot is always persisted together with the
//! success condition in one status update, so a crash between the two can
//! never leave pruning against a half-written inventory.

use crate::constants;
use crate::crd::{Condition, Kustomization, KustomizationStatus, Snapshot};
use anyhow::Result;
use kube::api::{Patch, PatchParams};
use kube::Api;
use kube::Client;
use tracing::debug;

/// Everything a terminal status write carries.
#[derive(Debug, Default)]
pub struct StatusUpdate {
    pub ready: bool,
    pub reason: &'static str,
    pub message: String,
    /// Revision of this attempt; updates `lastAttemptedRevision` when set.
    pub attempted_revision: Option<String>,
    /// Set only on success: `lastAppliedRevision` and the new snapshot.
    pub applied_revision: Option<String>,
    pub snapshot: Option<Snapshot>,
    /// Whether to overwrite the snapshot field at all. Failures keep the
    /// last known-good snapshot untouched.
    pub set_snapshot: bool,
    /// Trigger annotation value consumed by this run.
    pub handled_reconcile_at: Option<String>,
}

impl StatusUpdate {
    pub fn failure(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ready: true,
            reason: crate::crd::status::reasons::RECONCILIATION_SUCCEEDED,
            message: message.into(),
            set_snapshot: true,
            ..Default::default()
        }
    }
}

/// Patch the status sub-resource with the outcome of a reconciliation.
/// Unchanged fields (prior revisions, snapshot) are carried over from the
/// object's current status.
pub async fn write_status(client: &Client, ks: &Kustomization, update: StatusUpdate) -> Result<()> {
    let namespace = ks.metadata.namespace.as_deref().unwrap_or("default");
    let name = ks.metadata.name.as_deref().unwrap_or_default();
    let api: Api<Kustomization> = Api::namespaced(client.clone(), namespace);

    let current = ks.status.clone().unwrap_or_default();

    let mut conditions = current.conditions.clone();
    let ready_status = if update.ready { "True" } else { "False" };
    set_condition(
        &mut conditions,
        "Ready",
        ready_status,
        update.reason,
        &update.message,
    );

    let status = KustomizationStatus {
        observed_generation: ks.metadata.generation,
        conditions,
        last_attempted_revision: update
            .attempted_revision
            .or(current.last_attempted_revision),
        last_applied_revision: update.applied_revision.or(current.last_applied_revision),
        last_handled_reconcile_at: update
            .handled_reconcile_at
            .or(current.last_handled_reconcile_at),
        snapshot: if update.set_snapshot {
            update.snapshot
        } else {
            current.snapshot
        },
    };

    // Skipping no-op patches keeps the watch stream quiet: a status write
    // that changes nothing would still fan out to every watcher.
    if ks.status.as_ref().is_some_and(|s| statuses_equal(s, &status)) {
        debug!("skipping status update for {namespace}/{name}: unchanged");
        return Ok(());
    }

    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(constants::FIELD_MANAGER),
        &Patch::Merge(patch),
    )
    .await?;

    Ok(())
}

/// Single-slot condition update. `lastTransitionTime` only moves when the
/// status value actually transitions; message/reason changes alone keep it.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let mut new_condition = Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: if message.is_empty() {
            None
        } else {
            Some(message.to_string())
        },
    };

    for existing in conditions.iter_mut() {
        if existing.r#type == condition_type {
            if existing.status == new_condition.status {
                new_condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = new_condition;
            return;
        }
    }
    conditions.push(new_condition);
}

/// Find the Ready condition of a Kustomization.
pub fn ready_condition(ks: &Kustomization) -> Option<&Condition> {
    ks.status
        .as_ref()?
        .conditions
        .iter()
        .find(|c| c.r#type == "Ready")
}

fn statuses_equal(a: &KustomizationStatus, b: &KustomizationStatus) -> bool {
    let condition_key = |s: &KustomizationStatus| {
        s.conditions
            .iter()
            .map(|c| {
                (
                    c.r#type.clone(),
                    c.status.clone(),
                    c.reason.clone(),
                    c.message.clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    a.observed_generation == b.observed_generation
        && a.last_applied_revision == b.last_applied_revision
        && a.last_attempted_revision == b.last_attempted_revision
        && a.last_handled_reconcile_at == b.last_handled_reconcile_at
        && a.snapshot == b.snapshot
        && condition_key(a) == condition_key(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::status::reasons;

    #[test]
    fn test_set_condition_inserts_then_updates_in_place() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", "False", reasons::PROGRESSING, "");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");

        set_condition(
            &mut conditions,
            "Ready",
            "True",
            reasons::RECONCILIATION_SUCCEEDED,
            "applied revision main/abc123",
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(
            conditions[0].reason.as_deref(),
            Some(reasons::RECONCILIATION_SUCCEEDED)
        );
    }

    #[test]
    fn test_transition_time_preserved_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", "True", reasons::RECONCILIATION_SUCCEEDED, "a");
        let first_transition = conditions[0].last_transition_time.clone();

        set_condition(&mut conditions, "Ready", "True", reasons::RECONCILIATION_SUCCEEDED, "b");
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message.as_deref(), Some("b"));
    }

    #[test]
    fn test_transition_time_moves_on_status_change() {
        let mut conditions = vec![Condition {
            r#type: "Ready".to_string(),
            status: "True".to_string(),
            last_transition_time: Some("2020-01-01T00:00:00Z".to_string()),
            reason: None,
            message: None,
        }];
        set_condition(
            &mut conditions,
            "Ready",
            "False",
            reasons::ARTIFACT_FAILED,
            "gone",
        );
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_statuses_equal_ignores_transition_times() {
        let mut a = KustomizationStatus::default();
        set_condition(&mut a.conditions, "Ready", "True", reasons::RECONCILIATION_SUCCEEDED, "x");
        let mut b = KustomizationStatus::default();
        set_condition(&mut b.conditions, "Ready", "True", reasons::RECONCILIATION_SUCCEEDED, "x");
        b.conditions[0].last_transition_time = Some("1999-01-01T00:00:00Z".to_string());
        assert!(statuses_equal(&a, &b));
    }

    #[test]
    fn test_statuses_differ_on_revision_change() {
        let a = KustomizationStatus {
            last_applied_revision: Some("main/abc".to_string()),
            ..Default::default()
        };
        let b = KustomizationStatus {
            last_applied_revision: Some("main/def".to_string()),
            ..Default::default()
        };
        assert!(!statuses_equal(&a, &b));
    }
}
