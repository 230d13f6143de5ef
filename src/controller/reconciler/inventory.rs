//! # Inventory & Pruning
//!
//! Tracks the set of applied object identities per Kustomization revision
//! and garbage-collects orphans: objects present in the previous snapshot
//! but absent from the current build. The snapshot persisted on status is
//! the sole source of truth — live cluster state is never used to infer
//! ownership, because identity labels alone could match objects applied by
//! a sibling tool.

use crate::controller::reconciler::apply;
use crate::controller::reconciler::build;
use crate::controller::reconciler::cluster::TargetCluster;
use crate::crd::{Kustomization, ObjectIdentity, Snapshot};
use anyhow::{Context, Result};
use kube::api::{DeleteParams, PropagationPolicy};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Api;
use serde_json::Value;
use tracing::{info, warn};

/// Identity of a manifest document, or None for malformed documents (the
/// validator rejects those before apply).
pub fn identity_of(obj: &Value) -> Option<ObjectIdentity> {
    let gvk = apply::gvk_of(obj).ok()?;
    let name = obj.pointer("/metadata/name")?.as_str()?.to_string();
    let namespace = obj
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Some(ObjectIdentity {
        group: gvk.group,
        version: gvk.version,
        kind: gvk.kind,
        namespace,
        name,
    })
}

/// Build the snapshot for a successfully applied stream.
pub fn snapshot_from_stream(objects: &[Value], checksum: &str) -> Snapshot {
    let entries = objects.iter().filter_map(identity_of).collect();
    Snapshot::new(checksum.to_string(), entries)
}

/// Delete every identity in `old` that is absent from `new` on the target
/// cluster. NotFound is success; any other deletion failure fails the stage
/// but already-applied objects are never rolled back. Returns the deleted
/// identities.
pub async fn prune(
    target: &TargetCluster,
    old: &Snapshot,
    new: &Snapshot,
) -> Result<Vec<ObjectIdentity>> {
    let orphans = old.diff(new);
    if orphans.is_empty() {
        return Ok(Vec::new());
    }

    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for orphan in orphans {
        match delete_identity(target, &orphan).await {
            Ok(()) => {
                info!("pruned {}", orphan.display());
                deleted.push(orphan);
            }
            Err(e) => {
                warn!("failed to prune {}: {e:#}", orphan.display());
                failures.push((orphan, e));
            }
        }
    }

    if let Some((orphan, e)) = failures.into_iter().next() {
        return Err(anyhow::anyhow!(
            "failed to delete {}: {e:#}",
            orphan.display()
        ));
    }
    Ok(deleted)
}

/// Finalizer path: prune everything the snapshot holds, equivalent to
/// pruning against an empty new set.
pub async fn prune_all(target: &TargetCluster, snapshot: &Snapshot) -> Result<Vec<ObjectIdentity>> {
    let empty = Snapshot::new(String::new(), Vec::new());
    prune(target, snapshot, &empty).await
}

/// Delete one identity with foreground propagation so dependents of
/// owner-bearing kinds go down with their owner.
async fn delete_identity(target: &TargetCluster, identity: &ObjectIdentity) -> Result<()> {
    let ar = ApiResource::from_gvk(&GroupVersionKind {
        group: identity.group.clone(),
        version: identity.version.clone(),
        kind: identity.kind.clone(),
    });
    let api: Api<DynamicObject> = match &identity.namespace {
        Some(ns) if !build::is_cluster_scoped(&identity.kind) => {
            Api::namespaced_with(target.client.clone(), ns, &ar)
        }
        _ => Api::all_with(target.client.clone(), &ar),
    };

    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };

    match api.delete(&identity.name, &params).await {
        Ok(_) => Ok(()),
        // Already gone: pruning converged without us.
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e).with_context(|| format!("delete of {} failed", identity.display())),
    }
}

/// The snapshot to persist after a successful reconciliation: Some when
/// pruning is on, None otherwise (spec: prune=false keeps no inventory).
pub fn snapshot_for_status(ks: &Kustomization, objects: &[Value], checksum: &str) -> Option<Snapshot> {
    if ks.spec.prune {
        Some(snapshot_from_stream(objects, checksum))
    } else {
        None
    }
}
