//! # Reconciler
//!
//! The per-object state machine. One reconciliation drives:
//! fetch → decrypt → build → validate → apply → prune → health-check,
//! then writes the terminal status condition. Stage failures carry their
//! reason code; `lastAppliedRevision` and the snapshot are never rolled
//! back — they are the last known-good state and the next attempt re-applies
//! the full stream against them.

pub mod apply;
pub mod artifact;
pub mod build;
pub mod cluster;
pub mod decrypt;
pub mod deps;
pub mod health;
pub mod inventory;
pub mod status;
pub mod validate;

use crate::constants;
use crate::controller::events::EventPublisher;
use crate::crd::status::reasons;
use crate::crd::{Kustomization, ObjectIdentity, Snapshot};
use crate::observability::metrics;
use apply::ChangeSet;
use deps::{DependencyIndex, NamespacedName};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

/// Identity of a source object, used to map source watch events back to the
/// Kustomizations that consume it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Errors that escape the reconciler into the error policy. Handled stage
/// failures never surface here — they are written to status and requeued at
/// the spec interval; this type covers the unexpected: status patch
/// conflicts, finalizer bookkeeping, blocked finalization.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("status update failed: {0}")]
    Status(#[source] anyhow::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<ReconcilerError>>),

    #[error("finalization blocked: {0}")]
    Finalize(#[source] anyhow::Error),
}

/// Shared reconciler context: one per controller process.
pub struct Reconciler {
    pub client: Client,
    /// Config the controller's own client was built from; cloned for
    /// impersonation so auth headers never leak between reconciliations.
    pub base_config: kube::Config,
    pub events: EventPublisher,
    /// Cross-object dependency graph (forward + reverse indexes).
    pub deps: Mutex<DependencyIndex>,
    /// sourceRef bookkeeping: which Kustomization consumes which source.
    sources: Mutex<HashMap<NamespacedName, SourceKey>>,
    /// Dependents of a freshly Ready Kustomization are pushed here; the
    /// watch loop feeds the stream into the controller as an external
    /// trigger.
    trigger_tx: mpsc::UnboundedSender<ObjectRef<Kustomization>>,
    /// Fixed retry interval while dependencies are not ready.
    pub requeue_dependency: Duration,
    /// Per-resource consecutive unexpected-error counts, consumed by the
    /// error policy's fibonacci backoff.
    pub backoff_states: Mutex<HashMap<String, u32>>,
}

impl Reconciler {
    pub fn new(
        client: Client,
        base_config: kube::Config,
        trigger_tx: mpsc::UnboundedSender<ObjectRef<Kustomization>>,
        requeue_dependency: Duration,
    ) -> Self {
        let events = EventPublisher::new(client.clone(), constants::FIELD_MANAGER);
        Self {
            client,
            base_config,
            events,
            deps: Mutex::new(DependencyIndex::default()),
            sources: Mutex::new(HashMap::new()),
            trigger_tx,
            requeue_dependency,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// A clean pass resets the error-policy backoff for the resource.
    fn reset_backoff(&self, key: &NamespacedName) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(&key.to_string());
        }
    }

    /// Maintain the dependency and source indexes for one object. Returns
    /// back-edges that close a dependency cycle.
    fn update_indexes(&self, ks: &Kustomization) -> Vec<NamespacedName> {
        let key = NamespacedName::of(ks);
        let source_key = SourceKey {
            kind: ks.spec.source_ref.kind.clone(),
            namespace: ks.source_namespace(),
            name: ks.spec.source_ref.name.clone(),
        };
        self.sources
            .lock()
            .expect("source index lock poisoned")
            .insert(key, source_key);

        self.deps
            .lock()
            .expect("dependency index lock poisoned")
            .update(ks)
    }

    fn forget(&self, key: &NamespacedName) {
        self.sources
            .lock()
            .expect("source index lock poisoned")
            .remove(key);
        self.deps
            .lock()
            .expect("dependency index lock poisoned")
            .remove(key);
    }

    /// Kustomizations consuming the given source object. Called from the
    /// source watch mapper.
    pub fn kustomizations_for_source(&self, source: &SourceKey) -> Vec<ObjectRef<Kustomization>> {
        self.sources
            .lock()
            .expect("source index lock poisoned")
            .iter()
            .filter(|(_, s)| *s == source)
            .map(|(k, _)| ObjectRef::new(&k.name).within(&k.namespace))
            .collect()
    }

    /// Enqueue every dependent of a Kustomization that just became Ready.
    fn notify_dependents(&self, key: &NamespacedName) {
        let dependents = self
            .deps
            .lock()
            .expect("dependency index lock poisoned")
            .dependents_of(key);
        for dependent in dependents {
            info!("triggering dependent {dependent} of {key}");
            let reference = ObjectRef::new(&dependent.name).within(&dependent.namespace);
            if self.trigger_tx.send(reference).is_err() {
                warn!("dependent trigger channel closed; controller is shutting down");
            }
        }
    }
}

/// A handled stage failure: its condition reason, the message for status,
/// event and log, and the revision this attempt reached (when known).
#[derive(Debug)]
struct StageFailure {
    reason: &'static str,
    message: String,
    revision: Option<String>,
}

impl StageFailure {
    fn new(reason: &'static str, message: String, revision: Option<String>) -> Self {
        Self {
            reason,
            message,
            revision,
        }
    }
}

/// Everything a successful pass produced.
struct StageOutcome {
    revision: String,
    change_set: ChangeSet,
    snapshot: Option<Snapshot>,
    pruned: Vec<ObjectIdentity>,
}

/// Reconcile entry point, called by the controller watch loop.
pub async fn reconcile(
    ks: Arc<Kustomization>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let key = NamespacedName::of(&ks);
    let span = info_span!("reconcile", kustomization = %key);

    async move {
        metrics::increment_reconcile_total();

        let back_edges = ctx.update_indexes(&ks);
        for dep in back_edges {
            warn!("dependency cycle: '{key}' transitively depends on itself through '{dep}'");
            ctx.events
                .publish_warning(
                    &ks,
                    reasons::DEPENDENCY_NOT_READY,
                    format!("dependency cycle detected through '{dep}'; members will never become ready"),
                )
                .await;
        }

        let namespace = ks.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Kustomization> = Api::namespaced(ctx.client.clone(), &namespace);
        finalizer(&api, constants::KUSTOMIZATION_FINALIZER, ks, |event| async {
            match event {
                Finalizer::Apply(ks) => reconcile_apply(ks, ctx.clone()).await,
                Finalizer::Cleanup(ks) => reconcile_delete(ks, ctx.clone()).await,
            }
        })
        .await
        .map_err(|e| ReconcilerError::Finalizer(Box::new(e)))
    }
    .instrument(span)
    .await
}

/// The apply-direction state machine for one object.
async fn reconcile_apply(
    ks: Arc<Kustomization>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let key = NamespacedName::of(&ks);

    // Suspension ignores every trigger except the spec edit that clears it.
    // Deletion is not a trigger: the finalizer path runs regardless.
    if ks.spec.suspend {
        status::write_status(
            &ctx.client,
            &ks,
            status::StatusUpdate::failure(reasons::SUSPENDED, "reconciliation is suspended"),
        )
        .await
        .map_err(ReconcilerError::Status)?;
        return Ok(Action::await_change());
    }

    // Spec admission: a rejected object never fetches or applies, and is
    // not retried until the user edits the spec.
    if let Err(e) = validate::validate_spec(&ks) {
        let message = format!("{e:#}");
        error!("invalid Kustomization {key}: {message}");
        metrics::increment_reconcile_errors(reasons::VALIDATION_FAILED);
        status::write_status(
            &ctx.client,
            &ks,
            status::StatusUpdate::failure(reasons::VALIDATION_FAILED, message.clone()),
        )
        .await
        .map_err(ReconcilerError::Status)?;
        ctx.events
            .publish_warning(&ks, reasons::VALIDATION_FAILED, message)
            .await;
        return Ok(Action::await_change());
    }

    let interval = ks.interval();
    let requested_at = ks.requested_at();

    // Dependency gate: a single-hop readiness query per direct dependency.
    if !ks.spec.depends_on.is_empty() {
        if let Err(blocked) = deps::check_dependencies(&ctx.client, &ks).await {
            let message = blocked.to_string();
            info!("holding {key}: {message}");
            metrics::increment_dependency_blocked();
            status::write_status(
                &ctx.client,
                &ks,
                status::StatusUpdate::failure(reasons::DEPENDENCY_NOT_READY, message.clone()),
            )
            .await
            .map_err(ReconcilerError::Status)?;
            ctx.events
                .publish_warning(&ks, reasons::DEPENDENCY_NOT_READY, message)
                .await;
            return Ok(Action::requeue(ctx.requeue_dependency));
        }
    }

    // First reconciliation only: there is no prior snapshot to fall back
    // on, so surface that a run is in flight. Steady-state runs leave the
    // Ready condition alone until the outcome is known — rewriting it every
    // pass would re-trigger the any-semantic watch ad infinitum.
    let first_reconciliation = ks
        .status
        .as_ref()
        .map_or(true, |s| s.last_applied_revision.is_none());
    if first_reconciliation {
        status::write_status(
            &ctx.client,
            &ks,
            status::StatusUpdate::failure(reasons::PROGRESSING, "reconciliation in progress"),
        )
        .await
        .map_err(ReconcilerError::Status)?;
    }

    let timeout = ks.timeout();
    let deadline = Instant::now() + timeout;
    let started = std::time::Instant::now();

    let result = match tokio::time::timeout(timeout, run_stages(&ks, &ctx, deadline)).await {
        Ok(result) => result,
        Err(_) => Err(StageFailure::new(
            reasons::RECONCILIATION_FAILED,
            format!("reconciliation timed out after {}s", timeout.as_secs()),
            None,
        )),
    };
    metrics::observe_reconcile_duration(started.elapsed().as_secs_f64());

    match result {
        Ok(outcome) => {
            let message = format!("Applied revision: {}", outcome.revision);
            status::write_status(
                &ctx.client,
                &ks,
                status::StatusUpdate {
                    attempted_revision: Some(outcome.revision.clone()),
                    applied_revision: Some(outcome.revision.clone()),
                    snapshot: outcome.snapshot,
                    handled_reconcile_at: requested_at,
                    ..status::StatusUpdate::success(message.clone())
                },
            )
            .await
            .map_err(ReconcilerError::Status)?;

            info!(
                output = %serde_json::Value::Object(outcome.change_set.output()),
                "reconciliation succeeded (revision: {})",
                outcome.revision
            );
            if !outcome.pruned.is_empty() {
                metrics::increment_pruned_objects(outcome.pruned.len() as u64);
            }
            ctx.events
                .publish_normal(&ks, reasons::RECONCILIATION_SUCCEEDED, message)
                .await;

            ctx.reset_backoff(&key);
            ctx.notify_dependents(&key);
            Ok(Action::requeue(interval))
        }
        Err(failure) => {
            error!(
                "reconciliation of {key} failed at {}: {}",
                failure.reason, failure.message
            );
            metrics::increment_reconcile_errors(failure.reason);
            let event_message = match &failure.revision {
                Some(revision) => format!("{} (revision: {revision})", failure.message),
                None => failure.message.clone(),
            };
            status::write_status(
                &ctx.client,
                &ks,
                status::StatusUpdate {
                    ready: false,
                    reason: failure.reason,
                    message: failure.message,
                    attempted_revision: failure.revision,
                    applied_revision: None,
                    snapshot: None,
                    set_snapshot: false,
                    handled_reconcile_at: requested_at,
                },
            )
            .await
            .map_err(ReconcilerError::Status)?;
            ctx.events
                .publish_warning(&ks, failure.reason, event_message)
                .await;
            Ok(Action::requeue(interval))
        }
    }
}

/// Run the pipeline stages in order. Every stage maps its errors to the
/// stage's reason code; the first failure aborts the pass.
async fn run_stages(
    ks: &Kustomization,
    ctx: &Reconciler,
    deadline: Instant,
) -> Result<StageOutcome, StageFailure> {
    let target = cluster::resolve_target(&ctx.client, &ctx.base_config, ks)
        .await
        .map_err(|e| {
            StageFailure::new(
                reasons::RECONCILIATION_FAILED,
                format!("failed to resolve target cluster: {e:#}"),
                None,
            )
        })?;

    // Fetch
    let source = artifact::read_source_artifact(&ctx.client, ks)
        .await
        .map_err(|e| StageFailure::new(reasons::ARTIFACT_FAILED, format!("{e:#}"), None))?;
    let revision = source.revision.clone();
    let artifact_failed =
        |e: anyhow::Error| StageFailure::new(reasons::ARTIFACT_FAILED, format!("{e:#}"), Some(revision.clone()));
    let build_failed =
        |e: anyhow::Error| StageFailure::new(reasons::BUILD_FAILED, format!("{e:#}"), Some(revision.clone()));

    let namespace = ks.namespace().unwrap_or_else(|| "default".to_string());
    let name = ks.name_any();
    let scratch = artifact::ScratchDir::create(&namespace, &name)
        .await
        .map_err(artifact_failed)?;

    metrics::increment_artifact_downloads_total();
    let download_started = std::time::Instant::now();
    artifact::fetch_artifact(&source, scratch.path())
        .await
        .map_err(artifact_failed)?;
    metrics::observe_artifact_download_duration(download_started.elapsed().as_secs_f64());

    // Decrypt
    let source_root = artifact::unpack_path(scratch.path());
    if ks.spec.decryption.is_some() {
        let keys = decrypt::load_decryption_keys(&ctx.client, ks)
            .await
            .map_err(build_failed)?;
        decrypt::decrypt_tree(&keys, &source_root)
            .await
            .map_err(build_failed)?;
    }

    // Build
    let built = build::build_manifests(ks, &source_root)
        .await
        .map_err(build_failed)?;

    // Validate
    match ks.spec.validation.as_str() {
        "none" => {}
        "client" => {
            validate::validate_client(&built.objects).map_err(|e| {
                StageFailure::new(
                    reasons::VALIDATION_FAILED,
                    format!("{e:#}"),
                    Some(revision.clone()),
                )
            })?;
        }
        "server" => {
            validate::validate_server(&target, ks, &built.objects)
                .await
                .map_err(|e| {
                    StageFailure::new(
                        reasons::VALIDATION_FAILED,
                        format!("{e:#}"),
                        Some(revision.clone()),
                    )
                })?;
        }
        _ => unreachable!("validated at admission"),
    }

    // Apply
    let change_set = apply::apply_manifests(&target, ks, &built.objects)
        .await
        .map_err(|e| {
            StageFailure::new(
                reasons::RECONCILIATION_FAILED,
                format!("{e:#}"),
                Some(revision.clone()),
            )
        })?;
    if change_set.any_failed() {
        let first = change_set
            .first_failure()
            .expect("a failed change set has a failed entry");
        return Err(StageFailure::new(
            reasons::RECONCILIATION_FAILED,
            format!(
                "apply failed for {}: {}",
                first.subject,
                first.message.as_deref().unwrap_or("unknown error")
            ),
            Some(revision),
        ));
    }

    // Prune
    let old_snapshot = ks
        .status
        .as_ref()
        .and_then(|s| s.snapshot.clone())
        .unwrap_or_default();
    let mut pruned = Vec::new();
    let snapshot = inventory::snapshot_for_status(ks, &built.objects, &built.checksum);
    if let Some(new_snapshot) = &snapshot {
        pruned = inventory::prune(&target, &old_snapshot, new_snapshot)
            .await
            .map_err(|e| {
                StageFailure::new(
                    reasons::PRUNE_FAILED,
                    format!("{e:#}"),
                    Some(revision.clone()),
                )
            })?;
    }

    // Health check
    health::check_health(&target, ks, deadline).await.map_err(|e| {
        StageFailure::new(
            reasons::HEALTH_CHECK_FAILED,
            format!("{e:#}"),
            Some(revision.clone()),
        )
    })?;

    Ok(StageOutcome {
        revision,
        change_set,
        snapshot,
        pruned,
    })
}

/// Finalizer path: prune everything the snapshot holds, then allow removal.
/// Runs under its own deadline, not bounded by `spec.timeout`.
async fn reconcile_delete(
    ks: Arc<Kustomization>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let key = NamespacedName::of(&ks);
    info!("finalizing {key}");

    let snapshot = ks.status.as_ref().and_then(|s| s.snapshot.clone());
    if let Some(snapshot) = snapshot.filter(|s| !s.entries.is_empty()) {
        let target = cluster::resolve_target(&ctx.client, &ctx.base_config, &ks)
            .await
            .map_err(ReconcilerError::Finalize)?;

        let deadline = Duration::from_secs(constants::FINALIZER_TIMEOUT_SECS);
        let pruned = tokio::time::timeout(deadline, inventory::prune_all(&target, &snapshot))
            .await
            .map_err(|_| {
                ReconcilerError::Finalize(anyhow::anyhow!(
                    "finalizer prune timed out after {}s",
                    deadline.as_secs()
                ))
            })?
            .map_err(ReconcilerError::Finalize)?;

        if !pruned.is_empty() {
            metrics::increment_pruned_objects(pruned.len() as u64);
            ctx.events
                .publish_normal(
                    &ks,
                    reasons::RECONCILIATION_SUCCEEDED,
                    format!("pruned {} object(s) before removal", pruned.len()),
                )
                .await;
        }
    }

    ctx.forget(&key);
    Ok(Action::await_change())
}
