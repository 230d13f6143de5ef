//! # Error Policy
//!
//! Backoff for reconciliations that fail outside the handled stage-failure
//! path (status patch conflicts, finalizer bookkeeping), and classification
//! of watch stream errors. Handled stage failures requeue at
//! `spec.interval` from inside the reconciler; this policy only sees the
//! unexpected.

use crate::controller::reconciler::deps::NamespacedName;
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::crd::Kustomization;
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Fibonacci backoff over minutes: 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, capped
/// at 60. Grows fast enough to shed load from a persistently failing
/// resource without ever going quiet.
pub fn fibonacci_backoff(error_count: u32) -> Duration {
    let minutes = match error_count {
        0 | 1 => 1,
        2 => 2,
        3 => 3,
        4 => 5,
        5 => 8,
        6 => 13,
        7 => 21,
        8 => 34,
        9 => 55,
        _ => 60,
    };
    Duration::from_secs(minutes * 60)
}

/// Handle an unexpected reconciliation error with per-resource backoff.
/// Backoff state is tracked per resource so one failing object cannot slow
/// the rest of the fleet.
pub fn error_policy(
    ks: Arc<Kustomization>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let key = NamespacedName::of(&ks);
    error!("reconciliation error for {key}: {error}");

    let backoff = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let count = states.entry(key.to_string()).or_insert(0);
            let backoff = fibonacci_backoff(*count);
            *count += 1;
            backoff
        }
        Err(e) => {
            warn!("failed to lock backoff states: {e}, using default backoff");
            Duration::from_secs(60)
        }
    };

    warn!(
        "retrying {key} with backoff in {}s",
        backoff.as_secs()
    );
    Action::requeue(backoff)
}

/// Classification of errors surfaced by the controller watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// 401: RBAC was revoked or the service-account token expired.
    Unauthorized,
    /// 410: the resource version expired; routine during API server
    /// restarts, the watch re-lists and resumes.
    Expired,
    /// 429: the API server is shedding load.
    TooManyRequests,
    /// A watched object disappeared mid-stream.
    NotFound,
    /// Anything else.
    Other,
}

/// Classify a watch stream error by its message.
pub fn classify_watch_error(error: &str) -> WatchErrorClass {
    if error.contains("401") || error.contains("Unauthorized") {
        WatchErrorClass::Unauthorized
    } else if error.contains("410")
        || error.contains("too old resource version")
        || error.contains("Expired")
        || error.contains("Gone")
    {
        WatchErrorClass::Expired
    } else if error.contains("429")
        || error.contains("TooManyRequests")
        || error.contains("storage is (re)initializing")
    {
        WatchErrorClass::TooManyRequests
    } else if error.contains("ObjectNotFound")
        || (error.contains("404") && error.contains("not found"))
    {
        WatchErrorClass::NotFound
    } else {
        WatchErrorClass::Other
    }
}

/// Log a watch stream error at the severity its class deserves. The watcher
/// restarts with its own backoff; nothing needs to be retried here.
pub fn handle_watch_stream_error(error: &str) {
    match classify_watch_error(error) {
        WatchErrorClass::Unauthorized => {
            error!("watch authentication failed (401): {error}");
            error!("verify the controller's ClusterRole and ClusterRoleBinding are still in place and restart the pod if RBAC was recently changed");
        }
        WatchErrorClass::Expired => {
            warn!("watch resource version expired (410); this is routine during API server restarts, the watch will re-list and resume");
        }
        WatchErrorClass::TooManyRequests => {
            warn!("API server is shedding load (429); the watch backs off before resuming: {error}");
        }
        WatchErrorClass::NotFound => {
            warn!("watched object no longer exists, continuing: {error}");
        }
        WatchErrorClass::Other => {
            error!("controller stream error: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_sequence() {
        let minutes: Vec<u64> = (0..12).map(|n| fibonacci_backoff(n).as_secs() / 60).collect();
        assert_eq!(minutes, vec![1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 60, 60]);
    }

    #[test]
    fn test_backoff_is_capped_at_one_hour() {
        assert_eq!(fibonacci_backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_classify_unauthorized() {
        assert_eq!(
            classify_watch_error("ApiError: Unauthorized: Unauthorized (ErrorResponse { status: \"Failure\", code: 401 })"),
            WatchErrorClass::Unauthorized
        );
    }

    #[test]
    fn test_classify_expired_resource_version() {
        assert_eq!(
            classify_watch_error("too old resource version: 12345 (67890)"),
            WatchErrorClass::Expired
        );
        assert_eq!(
            classify_watch_error("ApiError: Expired: Gone (410)"),
            WatchErrorClass::Expired
        );
    }

    #[test]
    fn test_classify_too_many_requests() {
        assert_eq!(
            classify_watch_error("storage is (re)initializing"),
            WatchErrorClass::TooManyRequests
        );
    }

    #[test]
    fn test_classify_not_found_and_other() {
        assert_eq!(
            classify_watch_error("ObjectNotFound: kustomization gone"),
            WatchErrorClass::NotFound
        );
        assert_eq!(
            classify_watch_error("connection reset by peer"),
            WatchErrorClass::Other
        );
    }
}
