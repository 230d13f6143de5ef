//! # Constants
//!
//! Shared constants for the Kustomize Controller: identity labels, the
//! on-demand trigger annotation, field manager, and runtime defaults.

/// Controller name used for events and the server-side apply field manager.
/// The field manager must be stable so that subsequent applies reconcile
/// fields instead of conflicting.
pub const FIELD_MANAGER: &str = "kustomize-controller";

/// Finalizer that guarantees inventoried objects are pruned before a
/// Kustomization is removed.
pub const KUSTOMIZATION_FINALIZER: &str = "kustomize.toolkit.fluxcd.io/prune";

/// Identity label carrying the owning Kustomization's name.
pub const NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";

/// Identity label carrying the owning Kustomization's namespace.
pub const NAMESPACE_LABEL: &str = "kustomize.toolkit.fluxcd.io/namespace";

/// Identity label carrying the checksum of the built manifest stream.
/// Changes iff rendered content changes.
pub const CHECKSUM_LABEL: &str = "kustomize.toolkit.fluxcd.io/checksum";

/// On-demand trigger annotation. The controller compares its value to
/// `status.lastHandledReconcileAt` and forces a reconciliation when they
/// differ.
pub const RECONCILE_AT_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// API group of the source service objects referenced by `spec.sourceRef`.
pub const SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";

/// API version of the source service objects.
pub const SOURCE_VERSION: &str = "v1beta2";

/// Minimum allowed `spec.interval`.
pub const MIN_INTERVAL_SECS: u64 = 60;

/// Fixed retry interval while dependencies are not ready, independent of
/// `spec.interval`.
pub const DEFAULT_DEPENDENCY_REQUEUE_SECS: u64 = 30;

/// Bounded worker-pool size: how many Kustomizations reconcile in parallel.
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// Default port for the probe/metrics HTTP server.
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// How long to wait for the probe server to bind at startup.
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Poll interval while waiting for the probe server to bind.
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 100;

/// Bounded wait for a freshly applied CRD to report Established before any
/// custom resource of that kind is applied.
pub const CRD_ESTABLISHED_TIMEOUT_SECS: u64 = 30;

/// Health assessor backoff: initial delay between polls.
pub const HEALTH_POLL_BASE_SECS: u64 = 2;

/// Health assessor backoff cap.
pub const HEALTH_POLL_CAP_SECS: u64 = 30;

/// Deadline for the finalizer prune path. Deletion work is not bounded by
/// `spec.timeout`.
pub const FINALIZER_TIMEOUT_SECS: u64 = 300;

/// Root under which per-reconcile scratch directories are created. Cluster
/// owners may mount an emptyDir or PVC here.
pub const SCRATCH_BASE_PATH: &str = "/tmp/kustomize-controller";

/// Requeue applied when a handled failure has no usable `spec.interval`.
pub const FALLBACK_REQUEUE_SECS: u64 = 600;
