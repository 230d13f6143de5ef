//! # Health Assessment
//!
//! Waits (bounded) for the objects named in `spec.healthChecks` to report
//! readiness. Builtin workload kinds get kind-specific predicates; custom
//! resources fall back to the generic kstatus-style computation over
//! `status.conditions` and `status.observedGeneration`.

use crate::constants;
use crate::controller::reconciler::build;
use crate::controller::reconciler::cluster::TargetCluster;
use crate::crd::{CrossNamespaceObjectReference, Kustomization};
use anyhow::Result;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Api;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// kstatus-style result of a readiness computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    /// The object matches its desired state.
    Current,
    /// The object is converging.
    InProgress,
    /// The object reached a terminal failure.
    Failed,
    /// The object is being deleted.
    Terminating,
    /// The object does not exist.
    NotFound,
}

/// Wait until every health check reports Current, or fail naming the first
/// non-ready object. Checks poll concurrently; the deadline is the stage's
/// share of `spec.timeout`.
pub async fn check_health(
    target: &TargetCluster,
    ks: &Kustomization,
    deadline: Instant,
) -> Result<()> {
    if ks.spec.health_checks.is_empty() {
        return Ok(());
    }

    let default_namespace = ks
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let polls = ks
        .spec
        .health_checks
        .iter()
        .map(|check| poll_until_ready(target, check, &default_namespace, deadline));
    futures::future::try_join_all(polls).await?;
    Ok(())
}

/// Poll one object with exponential backoff (capped) until Current, a
/// terminal Failed, or the deadline.
async fn poll_until_ready(
    target: &TargetCluster,
    check: &CrossNamespaceObjectReference,
    default_namespace: &str,
    deadline: Instant,
) -> Result<()> {
    let subject = check_subject(check, default_namespace);
    let mut delay = Duration::from_secs(constants::HEALTH_POLL_BASE_SECS);

    loop {
        let status = fetch_status(target, check, default_namespace).await?;
        match status {
            ResourceStatus::Current => {
                debug!("health check passed: {subject}");
                return Ok(());
            }
            ResourceStatus::Failed => {
                return Err(anyhow::anyhow!("health check failed for {subject}"));
            }
            ResourceStatus::InProgress | ResourceStatus::Terminating | ResourceStatus::NotFound => {
                if Instant::now() + delay >= deadline {
                    return Err(anyhow::anyhow!(
                        "health check timed out waiting for {subject} (last status: {status:?})"
                    ));
                }
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(
                    delay * 2,
                    Duration::from_secs(constants::HEALTH_POLL_CAP_SECS),
                );
            }
        }
    }
}

fn check_subject(check: &CrossNamespaceObjectReference, default_namespace: &str) -> String {
    let namespace = check.namespace.as_deref().unwrap_or(default_namespace);
    format!("{}/{}/{}", check.kind, namespace, check.name)
}

async fn fetch_status(
    target: &TargetCluster,
    check: &CrossNamespaceObjectReference,
    default_namespace: &str,
) -> Result<ResourceStatus> {
    let (group, version) = match check.api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), check.api_version.clone()),
    };
    let ar = ApiResource::from_gvk(&GroupVersionKind {
        group,
        version,
        kind: check.kind.clone(),
    });

    let api: Api<DynamicObject> = if build::is_cluster_scoped(&check.kind) {
        Api::all_with(target.client.clone(), &ar)
    } else {
        let namespace = check.namespace.as_deref().unwrap_or(default_namespace);
        Api::namespaced_with(target.client.clone(), namespace, &ar)
    };

    let Some(obj) = api.get_opt(&check.name).await? else {
        return Ok(ResourceStatus::NotFound);
    };

    let value = serde_json::to_value(&obj)?;
    Ok(assess(&value, &check.kind))
}

/// Compute readiness for a fetched object.
pub fn assess(obj: &Value, kind: &str) -> ResourceStatus {
    if obj.pointer("/metadata/deletionTimestamp").is_some() {
        return ResourceStatus::Terminating;
    }

    match kind {
        "Deployment" => assess_deployment(obj),
        "StatefulSet" => assess_stateful_set(obj),
        "DaemonSet" => assess_daemon_set(obj),
        "Job" => assess_job(obj),
        "PersistentVolumeClaim" => assess_pvc(obj),
        "Pod" => assess_pod(obj),
        _ => assess_generic(obj),
    }
}

fn generation_observed(obj: &Value) -> bool {
    let generation = obj
        .pointer("/metadata/generation")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let observed = obj
        .pointer("/status/observedGeneration")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    observed >= generation
}

fn condition_status<'a>(obj: &'a Value, condition_type: &str) -> Option<&'a str> {
    obj.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition_type))?
        .get("status")?
        .as_str()
}

/// Deployment: observedGeneration ≥ generation, Available=True, and
/// updatedReplicas == replicas.
fn assess_deployment(obj: &Value) -> ResourceStatus {
    if !generation_observed(obj) {
        return ResourceStatus::InProgress;
    }
    if condition_status(obj, "ReplicaFailure") == Some("True") {
        return ResourceStatus::Failed;
    }
    let desired = obj
        .pointer("/spec/replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let updated = obj
        .pointer("/status/updatedReplicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if updated != desired || condition_status(obj, "Available") != Some("True") {
        return ResourceStatus::InProgress;
    }
    ResourceStatus::Current
}

fn assess_stateful_set(obj: &Value) -> ResourceStatus {
    if !generation_observed(obj) {
        return ResourceStatus::InProgress;
    }
    let desired = obj
        .pointer("/spec/replicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let ready = obj
        .pointer("/status/readyReplicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let updated = obj
        .pointer("/status/updatedReplicas")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if ready == desired && updated == desired {
        ResourceStatus::Current
    } else {
        ResourceStatus::InProgress
    }
}

fn assess_daemon_set(obj: &Value) -> ResourceStatus {
    if !generation_observed(obj) {
        return ResourceStatus::InProgress;
    }
    let desired = obj
        .pointer("/status/desiredNumberScheduled")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let ready = obj
        .pointer("/status/numberReady")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if desired > 0 && ready == desired {
        ResourceStatus::Current
    } else {
        ResourceStatus::InProgress
    }
}

/// Job: succeeded ≥ completions is Current; a Failed condition is terminal.
fn assess_job(obj: &Value) -> ResourceStatus {
    if condition_status(obj, "Failed") == Some("True") {
        return ResourceStatus::Failed;
    }
    if condition_status(obj, "Complete") == Some("True") {
        return ResourceStatus::Current;
    }
    let completions = obj
        .pointer("/spec/completions")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let succeeded = obj
        .pointer("/status/succeeded")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if succeeded >= completions {
        ResourceStatus::Current
    } else {
        ResourceStatus::InProgress
    }
}

fn assess_pvc(obj: &Value) -> ResourceStatus {
    match obj.pointer("/status/phase").and_then(|v| v.as_str()) {
        Some("Bound") => ResourceStatus::Current,
        Some("Lost") => ResourceStatus::Failed,
        _ => ResourceStatus::InProgress,
    }
}

fn assess_pod(obj: &Value) -> ResourceStatus {
    match obj.pointer("/status/phase").and_then(|v| v.as_str()) {
        Some("Succeeded") => ResourceStatus::Current,
        Some("Failed") => ResourceStatus::Failed,
        Some("Running") if condition_status(obj, "Ready") == Some("True") => {
            ResourceStatus::Current
        }
        _ => ResourceStatus::InProgress,
    }
}

/// Generic kstatus predicate for custom resources: a stalled/failed
/// condition is terminal, Ready=True with the generation observed is
/// Current, anything else is still converging. Objects exposing no status
/// at all are treated as Current — there is nothing to wait on.
fn assess_generic(obj: &Value) -> ResourceStatus {
    if condition_status(obj, "Stalled") == Some("True")
        || condition_status(obj, "Failed") == Some("True")
    {
        return ResourceStatus::Failed;
    }

    let has_conditions = obj
        .pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .is_some_and(|c| !c.is_empty());
    if !has_conditions {
        return ResourceStatus::Current;
    }

    if !generation_observed(obj) {
        return ResourceStatus::InProgress;
    }
    match condition_status(obj, "Ready") {
        Some("True") => ResourceStatus::Current,
        Some(_) => ResourceStatus::InProgress,
        None => ResourceStatus::Current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deployment_ready() {
        let obj = json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {
                "observedGeneration": 2,
                "updatedReplicas": 3,
                "conditions": [{"type": "Available", "status": "True"}],
            },
        });
        assert_eq!(assess(&obj, "Deployment"), ResourceStatus::Current);
    }

    #[test]
    fn test_deployment_stale_generation_is_in_progress() {
        let obj = json!({
            "metadata": {"generation": 3},
            "spec": {"replicas": 3},
            "status": {
                "observedGeneration": 2,
                "updatedReplicas": 3,
                "conditions": [{"type": "Available", "status": "True"}],
            },
        });
        assert_eq!(assess(&obj, "Deployment"), ResourceStatus::InProgress);
    }

    #[test]
    fn test_deployment_rollout_in_progress() {
        let obj = json!({
            "metadata": {"generation": 1},
            "spec": {"replicas": 3},
            "status": {
                "observedGeneration": 1,
                "updatedReplicas": 1,
                "conditions": [{"type": "Available", "status": "True"}],
            },
        });
        assert_eq!(assess(&obj, "Deployment"), ResourceStatus::InProgress);
    }

    #[test]
    fn test_job_terminal_states() {
        let failed = json!({
            "status": {"conditions": [{"type": "Failed", "status": "True"}]},
        });
        assert_eq!(assess(&failed, "Job"), ResourceStatus::Failed);

        let complete = json!({
            "status": {"succeeded": 1},
        });
        assert_eq!(assess(&complete, "Job"), ResourceStatus::Current);

        let running = json!({
            "status": {"active": 1},
        });
        assert_eq!(assess(&running, "Job"), ResourceStatus::InProgress);
    }

    #[test]
    fn test_pvc_phases() {
        assert_eq!(
            assess(&json!({"status": {"phase": "Bound"}}), "PersistentVolumeClaim"),
            ResourceStatus::Current
        );
        assert_eq!(
            assess(&json!({"status": {"phase": "Pending"}}), "PersistentVolumeClaim"),
            ResourceStatus::InProgress
        );
        assert_eq!(
            assess(&json!({"status": {"phase": "Lost"}}), "PersistentVolumeClaim"),
            ResourceStatus::Failed
        );
    }

    #[test]
    fn test_pod_ready() {
        let obj = json!({
            "status": {
                "phase": "Running",
                "conditions": [{"type": "Ready", "status": "True"}],
            },
        });
        assert_eq!(assess(&obj, "Pod"), ResourceStatus::Current);
    }

    #[test]
    fn test_terminating_wins_over_everything() {
        let obj = json!({
            "metadata": {"deletionTimestamp": "2026-01-01T00:00:00Z"},
            "status": {"phase": "Bound"},
        });
        assert_eq!(assess(&obj, "PersistentVolumeClaim"), ResourceStatus::Terminating);
    }

    #[test]
    fn test_generic_custom_resource_ready_condition() {
        let obj = json!({
            "metadata": {"generation": 1},
            "status": {
                "observedGeneration": 1,
                "conditions": [{"type": "Ready", "status": "True"}],
            },
        });
        assert_eq!(assess(&obj, "GitRepository"), ResourceStatus::Current);

        let converging = json!({
            "metadata": {"generation": 2},
            "status": {
                "observedGeneration": 1,
                "conditions": [{"type": "Ready", "status": "True"}],
            },
        });
        assert_eq!(assess(&converging, "GitRepository"), ResourceStatus::InProgress);
    }

    #[test]
    fn test_generic_stalled_is_terminal() {
        let obj = json!({
            "status": {"conditions": [{"type": "Stalled", "status": "True"}]},
        });
        assert_eq!(assess(&obj, "HelmRelease"), ResourceStatus::Failed);
    }

    #[test]
    fn test_generic_without_conditions_is_current() {
        let obj = json!({
            "metadata": {"generation": 1},
            "status": {},
        });
        assert_eq!(assess(&obj, "ConfigMapLike"), ResourceStatus::Current);
    }
}
