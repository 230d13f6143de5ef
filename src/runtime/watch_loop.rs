//! # Watch Loop
//!
//! Wires the controller: an any-semantic watch on Kustomizations (so
//! annotation-only edits such as the on-demand trigger fire), a watch on
//! source objects mapped through the source index, the dependent-trigger
//! stream from the scheduler, bounded concurrency, and the error policy.

use crate::cli::ControllerArgs;
use crate::constants;
use crate::controller::reconciler::{reconcile, SourceKey};
use crate::runtime::error_policy::{error_policy, handle_watch_stream_error};
use crate::runtime::initialization::InitializationResult;
use anyhow::Result;
use futures::StreamExt;
use kube::api::ApiResource;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::runtime::controller::{Config as ControllerConfig, Controller};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::debug;

/// Run the controller until shutdown.
pub async fn run_watch_loop(init: InitializationResult, args: &ControllerArgs) -> Result<()> {
    let ctx = init.reconciler;

    // Dependent completions arrive over the scheduler's channel and force a
    // reconciliation regardless of interval.
    let trigger_stream = futures::stream::unfold(init.trigger_rx, |mut rx| async move {
        rx.recv().await.map(|reference| (reference, rx))
    });

    // Source revision changes: watch GitRepository objects and map each
    // event to the Kustomizations consuming that source.
    let source_ar = ApiResource::from_gvk(&GroupVersionKind {
        group: constants::SOURCE_GROUP.to_string(),
        version: constants::SOURCE_VERSION.to_string(),
        kind: "GitRepository".to_string(),
    });
    let sources: Api<DynamicObject> = match &args.watch_namespace {
        Some(namespace) => Api::namespaced_with(init.client.clone(), namespace, &source_ar),
        None => Api::all_with(init.client.clone(), &source_ar),
    };
    let mapper_ctx = ctx.clone();

    Controller::new(
        init.kustomizations,
        watcher::Config::default().any_semantic(),
    )
    .with_config(ControllerConfig::default().concurrency(args.concurrent))
    .shutdown_on_signal()
    .watches_with(
        sources,
        source_ar,
        watcher::Config::default().any_semantic(),
        move |source: DynamicObject| {
            let key = SourceKey {
                kind: "GitRepository".to_string(),
                namespace: source.namespace().unwrap_or_default(),
                name: source.name_any(),
            };
            mapper_ctx.kustomizations_for_source(&key)
        },
    )
    .reconcile_on(trigger_stream)
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok((reference, _action)) => debug!("reconciled {reference}"),
            Err(e) => handle_watch_stream_error(&e.to_string()),
        }
    })
    .await;

    Ok(())
}
