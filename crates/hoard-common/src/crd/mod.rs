//! Custom Resource Definitions for hoard
//!
//! This module contains the Dataset CRD and the types it is built from.

mod affinity;
mod cache_status;
mod dataset;
mod phase;

pub use affinity::{
    is_valid_label_key, is_valid_label_value, CacheableNodeAffinity, NodeConstraint,
    MAX_CONSTRAINT_DEPTH,
};
pub use cache_status::CacheStatus;
pub use dataset::{
    admit_status, Dataset, DatasetKey, DatasetOptions, DatasetSpec, DatasetStatus, ReplicaBounds,
};
pub use phase::CachePhase;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

use crate::registry::ResourceRegistry;

/// Register every hoard resource type. Call once at process start.
pub fn register(registry: &mut ResourceRegistry) {
    registry.register::<Dataset>();
}

/// Open object schema for recursive fields, which structural CRD schemas
/// cannot express. Shape is enforced by deserialization and `validate()`.
pub(crate) fn raw_object_schema(_gen: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// Decode a YAML fixture the way the API server delivers it: as JSON
#[cfg(test)]
pub(crate) fn from_yaml<T: serde::de::DeserializeOwned>(yaml: &str) -> serde_json::Result<T> {
    let value: serde_json::Value =
        serde_yaml::from_str(yaml).map_err(<serde_json::Error as serde::de::Error>::custom)?;
    serde_json::from_value(value)
}
