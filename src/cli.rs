//! # Controller Flags
//!
//! Command-line flags for the controller binary.

use crate::constants;
use clap::{Parser, ValueEnum};

/// Kustomize Controller: reconciles Kustomization resources by building
/// kustomize overlays from source artifacts and applying them to the
/// target cluster.
#[derive(Parser, Debug, Clone)]
#[command(name = "kustomize-controller", version)]
pub struct ControllerArgs {
    /// Port for the probe/metrics HTTP server.
    #[arg(long, env = "METRICS_PORT", default_value_t = constants::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// How many Kustomizations may reconcile in parallel.
    #[arg(long, default_value_t = constants::DEFAULT_CONCURRENCY)]
    pub concurrent: u16,

    /// Retry interval in seconds while a dependency is not ready.
    #[arg(long, default_value_t = constants::DEFAULT_DEPENDENCY_REQUEUE_SECS)]
    pub requeue_dependency: u64,

    /// Restrict the watch to a single namespace; watches all namespaces
    /// when unset.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}
