//! Controller wiring
//!
//! Watches Datasets plus the worker report ConfigMaps, mapping each report
//! back to its Dataset so cache progress triggers a reconcile right away.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use hoard_common::crd::Dataset;
use hoard_dataset::report::{report_owner, REPORT_SELECTOR};
use hoard_dataset::{error_policy, reconcile, Context, ControllerConfig};

/// Watcher timeout (seconds); must stay under the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the Dataset controller until a shutdown signal arrives
pub async fn run_dataset_controller(client: Client, config: ControllerConfig) {
    let namespace = config.watch_namespace.clone();
    match namespace.as_deref() {
        Some(ns) => tracing::info!(namespace = %ns, "watching Datasets in one namespace"),
        None => tracing::info!("watching Datasets in all namespaces"),
    }

    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
    let datasets: Api<Dataset> = scoped(client.clone(), namespace.as_deref());
    let reports: Api<ConfigMap> = scoped(client, namespace.as_deref());

    Controller::new(
        datasets,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .watches(
        reports,
        WatcherConfig::default()
            .labels(REPORT_SELECTOR)
            .timeout(WATCH_TIMEOUT_SECS),
        |cm| report_owner(&cm),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        match result {
            Ok((dataset, action)) => {
                tracing::debug!(dataset = %dataset, ?action, "Dataset reconciliation completed")
            }
            Err(e) => tracing::error!(error = ?e, "Dataset reconciliation error"),
        }
        std::future::ready(())
    })
    .await;

    tracing::info!("Dataset controller stopped");
}
