//! # Apply
//!
//! Applies the built object stream to the target cluster via server-side
//! apply with a stable field manager, producing a per-object action report.
//! CRDs and Namespaces go first, and custom resources wait for their CRD to
//! be established.

use crate::constants;
use crate::controller::reconciler::build;
use crate::controller::reconciler::cluster::TargetCluster;
use crate::crd::Kustomization;
use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::wait::{await_condition, conditions};
use kube::Api;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of applying a single object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Configured,
    Unchanged,
    Failed,
}

impl ApplyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyAction::Created => "created",
            ApplyAction::Configured => "configured",
            ApplyAction::Unchanged => "unchanged",
            ApplyAction::Failed => "failed",
        }
    }
}

/// Per-object apply report for one reconciliation.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    /// `<kind>.<group>/<name>` subject used in logs and events.
    pub subject: String,
    pub action: ApplyAction,
    /// Error message for failed entries.
    pub message: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn any_failed(&self) -> bool {
        self.entries.iter().any(|e| e.action == ApplyAction::Failed)
    }

    pub fn first_failure(&self) -> Option<&ChangeEntry> {
        self.entries.iter().find(|e| e.action == ApplyAction::Failed)
    }

    /// `<kind>.<group>/<name>` → action, logged on success.
    pub fn output(&self) -> serde_json::Map<String, Value> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.subject.clone(),
                    Value::String(e.action.as_str().to_string()),
                )
            })
            .collect()
    }
}

/// Field manager identity for server-side apply: stable per Kustomization
/// so subsequent applies reconcile fields instead of conflicting, and
/// distinct across Kustomizations so ownership is attributable.
pub fn field_manager(ks: &Kustomization) -> String {
    format!(
        "{}-{}-{}",
        constants::FIELD_MANAGER,
        ks.metadata.namespace.as_deref().unwrap_or("default"),
        ks.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Parse the GroupVersionKind of a manifest document.
pub fn gvk_of(obj: &Value) -> Result<GroupVersionKind> {
    let api_version = obj
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .context("object is missing apiVersion")?;
    let kind = obj
        .get("kind")
        .and_then(|v| v.as_str())
        .context("object is missing kind")?;

    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok(GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    })
}

/// Log/event subject for an object: `<kind>.<group>/<name>` (namespaced
/// subjects include the namespace).
pub fn subject_of(obj: &Value) -> String {
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("?");
    let group = obj
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .map(|av| av.split_once('/').map(|(g, _)| g).unwrap_or("v1"))
        .unwrap_or("v1");
    let name = obj
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .unwrap_or("?");
    match obj.pointer("/metadata/namespace").and_then(|v| v.as_str()) {
        Some(ns) => format!("{kind}.{group}/{ns}/{name}"),
        None => format!("{kind}.{group}/{name}"),
    }
}

/// Build the dynamic API and name for a manifest document against the target
/// cluster.
pub fn dynamic_api_for(
    target: &TargetCluster,
    ks: &Kustomization,
    obj: &Value,
) -> Result<(Api<DynamicObject>, String, String)> {
    let gvk = gvk_of(obj)?;
    let name = obj
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .context("object is missing metadata.name")?
        .to_string();
    let display = subject_of(obj);

    let ar = ApiResource::from_gvk(&gvk);
    let api = if build::is_cluster_scoped(&gvk.kind) {
        Api::all_with(target.client.clone(), &ar)
    } else {
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| ks.metadata.namespace.clone())
            .unwrap_or_else(|| "default".to_string());
        Api::namespaced_with(target.client.clone(), &namespace, &ar)
    };

    Ok((api, name, display))
}

/// Apply the stream in order. A single object failure does not abort the
/// batch; the batch is failed iff any object failed.
pub async fn apply_manifests(
    target: &TargetCluster,
    ks: &Kustomization,
    objects: &[Value],
) -> Result<ChangeSet> {
    let params = PatchParams::apply(&field_manager(ks)).force();
    let mut change_set = ChangeSet::default();

    // Resources that must logically precede others: Namespaces so that
    // namespaced objects land, CRDs so their custom resources are known.
    let (priority, rest): (Vec<&Value>, Vec<&Value>) = objects.iter().partition(|obj| {
        matches!(
            obj.get("kind").and_then(|k| k.as_str()),
            Some("Namespace") | Some("CustomResourceDefinition")
        )
    });

    let mut applied_crds = Vec::new();
    for obj in &priority {
        let entry = apply_object(target, ks, obj, &params).await;
        if entry.action != ApplyAction::Failed
            && obj.get("kind").and_then(|k| k.as_str()) == Some("CustomResourceDefinition")
        {
            if let Some(name) = obj.pointer("/metadata/name").and_then(|v| v.as_str()) {
                applied_crds.push(name.to_string());
            }
        }
        change_set.entries.push(entry);
    }

    for crd_name in &applied_crds {
        wait_crd_established(target, crd_name).await;
    }

    for obj in &rest {
        let entry = apply_object(target, ks, obj, &params).await;
        change_set.entries.push(entry);
    }

    Ok(change_set)
}

/// Server-side apply one object and classify the action by comparing the
/// resourceVersion before and after; the API server does the diffing.
async fn apply_object(
    target: &TargetCluster,
    ks: &Kustomization,
    obj: &Value,
    params: &PatchParams,
) -> ChangeEntry {
    let subject = subject_of(obj);

    let result: Result<ApplyAction> = async {
        let (api, name, _) = dynamic_api_for(target, ks, obj)?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone())
            .with_context(|| format!("failed to convert {subject} to a dynamic object"))?;

        let existing_version = api
            .get_opt(&name)
            .await
            .with_context(|| format!("failed to read current state of {subject}"))?
            .and_then(|current| current.metadata.resource_version);

        let applied = api
            .patch(&name, params, &Patch::Apply(&dynamic))
            .await
            .with_context(|| format!("failed to apply {subject}"))?;

        let action = match existing_version {
            None => ApplyAction::Created,
            Some(before) => {
                if applied.metadata.resource_version.as_deref() == Some(before.as_str()) {
                    ApplyAction::Unchanged
                } else {
                    ApplyAction::Configured
                }
            }
        };
        debug!("{subject}: {}", action.as_str());
        Ok(action)
    }
    .await;

    match result {
        Ok(action) => ChangeEntry {
            subject,
            action,
            message: None,
        },
        Err(e) => {
            warn!("{subject}: apply failed: {e:#}");
            ChangeEntry {
                subject,
                action: ApplyAction::Failed,
                message: Some(format!("{e:#}")),
            }
        }
    }
}

/// Bounded wait for a freshly applied CRD to report Established. A timeout
/// is not fatal here; the subsequent custom-resource apply surfaces the
/// error with better context.
async fn wait_crd_established(target: &TargetCluster, crd_name: &str) {
    let api: Api<CustomResourceDefinition> = Api::all(target.client.clone());
    let establish = await_condition(api, crd_name, conditions::is_crd_established());
    if tokio::time::timeout(
        Duration::from_secs(constants::CRD_ESTABLISHED_TIMEOUT_SECS),
        establish,
    )
    .await
    .is_err()
    {
        warn!("CRD {crd_name} was not established within the bounded wait");
    }
}
