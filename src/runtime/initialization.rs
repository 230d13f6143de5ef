//! # Initialization
//!
//! Controller startup: rustls setup, tracing subscriber, metrics
//! registration, probe server, Kubernetes client, and the reconciler
//! context. Also verifies the CRD is queryable and logs a summary of
//! existing resources before the watch starts.

use crate::cli::{ControllerArgs, LogFormat};
use crate::constants;
use crate::controller::reconciler::Reconciler;
use crate::crd::Kustomization;
use crate::observability::metrics;
use crate::runtime::server::{start_server, ServerState};
use anyhow::{Context, Result};
use kube::api::ListParams;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, Config};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Everything the watch loop needs, produced once at startup.
pub struct InitializationResult {
    pub client: Client,
    pub kustomizations: Api<Kustomization>,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
    /// Receiving side of the dependent-trigger channel; the watch loop
    /// feeds it into the controller as an external trigger stream.
    pub trigger_rx: mpsc::UnboundedReceiver<ObjectRef<Kustomization>>,
}

/// Initialize the controller runtime.
pub async fn initialize(args: &ControllerArgs) -> Result<InitializationResult> {
    // rustls needs a process-wide crypto provider before the first TLS
    // connection is attempted.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    init_tracing(args);

    info!(
        "starting kustomize-controller v{} (concurrency: {})",
        env!("CARGO_PKG_VERSION"),
        args.concurrent
    );

    metrics::register_metrics()?;

    let server_state = ServerState::new();
    let server_state_for_task = server_state.clone();
    let metrics_port = args.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, server_state_for_task).await {
            error!("probe server error: {e:#}");
        }
    });
    wait_for_server_bound(&server_state, &server_handle).await?;

    let config = Config::infer()
        .await
        .context("failed to infer Kubernetes client configuration")?;
    let client = Client::try_from(config.clone()).context("failed to build Kubernetes client")?;

    let kustomizations: Api<Kustomization> = match &args.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        config,
        trigger_tx,
        std::time::Duration::from_secs(args.requeue_dependency),
    ));

    log_existing_resources(&kustomizations).await;

    server_state.is_ready.store(true, Ordering::Relaxed);
    info!("controller initialized, starting watch loop");

    Ok(InitializationResult {
        client,
        kustomizations,
        reconciler,
        server_state,
        trigger_rx,
    })
}

fn init_tracing(args: &ControllerArgs) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kustomize_controller=info".into());
    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Wait for the probe server to bind so readiness probes do not race the
/// listener at startup.
async fn wait_for_server_bound(
    state: &Arc<ServerState>,
    handle: &tokio::task::JoinHandle<()>,
) -> Result<()> {
    let timeout = std::time::Duration::from_secs(constants::DEFAULT_SERVER_STARTUP_TIMEOUT_SECS);
    let poll = std::time::Duration::from_millis(constants::DEFAULT_SERVER_POLL_INTERVAL_MS);
    let started = std::time::Instant::now();

    loop {
        if handle.is_finished() {
            return Err(anyhow::anyhow!("probe server failed to start"));
        }
        if state.is_bound.load(Ordering::Relaxed) {
            return Ok(());
        }
        if started.elapsed() > timeout {
            return Err(anyhow::anyhow!(
                "probe server failed to bind within {}s",
                timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll).await;
    }
}

/// Verify the CRD is queryable and log what the controller is taking over.
/// Existing resources are reconciled by the controller's initial list-watch,
/// so no explicit pass is needed here.
async fn log_existing_resources(api: &Api<Kustomization>) {
    match api.list(&ListParams::default()).await {
        Ok(list) => {
            info!(
                "CRD is queryable, found {} existing Kustomization(s)",
                list.items.len()
            );
            let mut names: Vec<String> = list
                .items
                .iter()
                .map(|ks| {
                    format!(
                        "{}/{}",
                        ks.metadata.namespace.as_deref().unwrap_or("default"),
                        ks.metadata.name.as_deref().unwrap_or("unknown")
                    )
                })
                .collect();
            names.sort();
            for name in names {
                info!("  {name}");
            }
        }
        Err(e) => {
            error!("CRD is not queryable: {e}. Is the Kustomization CRD installed?");
            warn!("continuing despite CRD check failure; the watch will retry");
        }
    }
}
