//! CRD installation on startup
//!
//! The operator applies its own CRDs with server-side apply so the schema in
//! the cluster always matches the running binary.

use std::time::Duration;

use anyhow::Context as _;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, ResourceExt};

use hoard_common::registry::ResourceRegistry;
use hoard_common::FIELD_MANAGER;

const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Apply every registered CRD and wait until the apiserver serves it
pub async fn ensure_crds_installed(client: &Client, registry: &ResourceRegistry) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in registry.crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(crd))
            .await
            .with_context(|| format!("failed to install {} CRD", name))?;
    }

    for crd in registry.crds() {
        let name = crd.name_any();
        tokio::time::timeout(
            ESTABLISH_TIMEOUT,
            await_condition(crds.clone(), &name, conditions::is_crd_established()),
        )
        .await
        .with_context(|| format!("timed out waiting for {} CRD to be established", name))?
        .with_context(|| format!("failed waiting for {} CRD", name))?;
        tracing::debug!(crd = %name, "CRD established");
    }

    tracing::info!(count = registry.len(), "CRDs installed/updated");
    Ok(())
}

/// CRD manifests as a multi-document YAML stream
pub fn render_crds(registry: &ResourceRegistry) -> anyhow::Result<String> {
    let docs = registry
        .crds()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to serialize CRD")?;
    Ok(docs.join("---\n"))
}
