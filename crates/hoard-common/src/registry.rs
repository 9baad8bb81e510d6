//! Explicit registry of the resource types this process serves
//!
//! The operator builds one at startup, registers every type it owns, and
//! then drives CRD installation and `--crd` output from it.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;
use tracing::debug;

/// Resource kinds and their CRDs, keyed by kind
#[derive(Clone, Debug, Default)]
pub struct ResourceRegistry {
    crds: BTreeMap<String, CustomResourceDefinition>,
}

impl ResourceRegistry {
    /// Registry with every hoard type registered
    pub fn with_hoard_types() -> Self {
        let mut registry = Self::default();
        crate::crd::register(&mut registry);
        registry
    }

    /// Register a custom resource type. Re-registering a kind replaces it.
    pub fn register<K: CustomResourceExt>(&mut self) {
        let crd = K::crd();
        let kind = crd.spec.names.kind.clone();
        debug!(kind = %kind, crd = %K::crd_name(), "registered resource type");
        self.crds.insert(kind, crd);
    }

    /// CRD for a registered kind
    pub fn get(&self, kind: &str) -> Option<&CustomResourceDefinition> {
        self.crds.get(kind)
    }

    /// All registered CRDs in kind order
    pub fn crds(&self) -> impl Iterator<Item = &CustomResourceDefinition> {
        self.crds.values()
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.crds.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.crds.is_empty()
    }
}
