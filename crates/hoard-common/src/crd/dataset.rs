//! Dataset Custom Resource Definition
//!
//! A Dataset is an externally hosted dataset mounted from `mountPoint` and
//! progressively cached onto worker nodes. Users own the spec; the controller
//! owns the status and is the only writer of cache counters and phase.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::Node;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::affinity::CacheableNodeAffinity;
use super::cache_status::CacheStatus;
use super::phase::CachePhase;
use crate::error::UNKNOWN_CONTEXT;
use crate::quantity::{ByteQuantity, CachedRatio};
use crate::Error;

/// Desired state of a Dataset
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "data.hoard.dev",
    version = "v1alpha1",
    kind = "Dataset",
    plural = "datasets",
    shortname = "ds",
    namespaced,
    status = "DatasetStatus",
    printcolumn = r#"{"name":"Mount","type":"string","jsonPath":".spec.mountPoint"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Cached","type":"string","jsonPath":".status.cacheStatus.cached"}"#,
    printcolumn = r#"{"name":"Cacheable","type":"string","jsonPath":".status.cacheStatus.cacheable"}"#,
    printcolumn = r#"{"name":"Total","type":"string","jsonPath":".status.total"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    /// Source URI (e.g. `s3://bucket/imagenet`)
    pub mount_point: String,

    /// Access options for the source (credentials, endpoints)
    #[serde(default, skip_serializing_if = "DatasetOptions::is_empty")]
    pub options: DatasetOptions,

    /// Lower bound on cache-serving replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound on cache-serving replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Nodes allowed to hold cached copies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<CacheableNodeAffinity>,
}

/// Source access options
///
/// Values may be secrets; `Debug` prints keys only.
#[derive(Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
pub struct DatasetOptions(BTreeMap<String, String>);

impl DatasetOptions {
    /// Look up an option
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set an option, returning the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Option keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Key/value pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of options
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no options are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DatasetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DatasetOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// RFC 3986 scheme: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )
fn is_uri_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn validate_mount_point(mount_point: &str) -> Result<(), Error> {
    if mount_point.is_empty() {
        return Err(Error::invalid_spec_field(
            "spec.mountPoint",
            "mountPoint is required",
        ));
    }
    if mount_point.chars().any(char::is_whitespace) {
        return Err(Error::invalid_spec_field(
            "spec.mountPoint",
            format!("mountPoint '{}' contains whitespace", mount_point),
        ));
    }
    match mount_point.split_once("://") {
        Some((scheme, rest)) if is_uri_scheme(scheme) && !rest.is_empty() => Ok(()),
        _ => Err(Error::invalid_spec_field(
            "spec.mountPoint",
            format!("mountPoint '{}' is not a valid URI (expected scheme://path)", mount_point),
        )),
    }
}

/// Replica bounds for consumers that size cache-serving workloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaBounds {
    /// Lower bound, if any
    pub min: Option<i32>,
    /// Upper bound, if any
    pub max: Option<i32>,
}

impl ReplicaBounds {
    /// Clamp a desired replica count into the bounds (never below zero)
    pub fn clamp(&self, desired: i32) -> i32 {
        let mut n = desired.max(0);
        if let Some(min) = self.min {
            n = n.max(min);
        }
        if let Some(max) = self.max {
            n = n.min(max);
        }
        n
    }
}

impl DatasetSpec {
    /// Validate desired state on create
    pub fn validate(&self) -> Result<(), Error> {
        validate_mount_point(&self.mount_point)?;

        for (field, bound) in [
            ("spec.minReplicas", self.min_replicas),
            ("spec.maxReplicas", self.max_replicas),
        ] {
            if let Some(n) = bound.filter(|n| *n < 0) {
                return Err(Error::invalid_spec_field(
                    field,
                    format!("replica bound {} must be >= 0", n),
                ));
            }
        }
        if let (Some(min), Some(max)) = (self.min_replicas, self.max_replicas) {
            if min > max {
                return Err(Error::invalid_spec_field(
                    "spec.minReplicas",
                    format!("minReplicas {} > maxReplicas {}", min, max),
                ));
            }
        }

        if self.options.keys().any(str::is_empty) {
            return Err(Error::invalid_spec_field(
                "spec.options",
                "option keys must be non-empty",
            ));
        }

        if let Some(affinity) = &self.node_affinity {
            affinity.validate()?;
        }
        Ok(())
    }

    /// Validate `new` as a replacement for `self` given the observed status.
    ///
    /// `mountPoint` is frozen once loading began. Options may be added or
    /// rotated freely.
    pub fn validate_update(
        &self,
        new: &DatasetSpec,
        status: Option<&DatasetStatus>,
    ) -> Result<(), Error> {
        new.validate()?;
        if self.mount_point != new.mount_point && status.is_some_and(DatasetStatus::loading_started)
        {
            return Err(Error::immutable_field(UNKNOWN_CONTEXT, "spec.mountPoint"));
        }
        Ok(())
    }

    /// Replica bounds as declared
    pub fn replica_bounds(&self) -> ReplicaBounds {
        ReplicaBounds {
            min: self.min_replicas,
            max: self.max_replicas,
        }
    }

    /// Whether a node with `labels` may hold cached copies
    pub fn allows_node(&self, labels: &BTreeMap<String, String>) -> bool {
        self.node_affinity
            .as_ref()
            .map_or(true, |a| a.matches(labels))
    }

    /// Nodes from `nodes` allowed to hold cached copies
    pub fn eligible_nodes<'a>(&self, nodes: &'a [Node]) -> Vec<&'a Node> {
        nodes
            .iter()
            .filter(|node| self.allows_node(node.labels()))
            .collect()
    }
}

/// Observed state of a Dataset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStatus {
    /// Logical dataset size
    #[serde(default)]
    pub total: ByteQuantity,

    /// Size as reported by the source filesystem
    #[serde(default)]
    pub ufs_total: ByteQuantity,

    /// Cache counters
    #[serde(default)]
    pub cache_status: CacheStatus,

    /// Lifecycle phase; absent until the controller first writes status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CachePhase>,

    /// Generation of the spec last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Mount point the cache was loaded from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_mount_point: Option<String>,

    /// Reason for the last rejected observation or spec problem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Admit a proposed status against the committed one.
///
/// Derived counters are recomputed, the byte invariant is checked, and the
/// requested phase is checked against the current phase using the proposed
/// counters. A proposal without a phase keeps the current phase. On error
/// nothing is returned, so the caller's committed status stays as it was.
pub fn admit_status(current: &DatasetStatus, proposed: DatasetStatus) -> Result<DatasetStatus, Error> {
    let cache_status = CacheStatus::derive(
        proposed.total,
        proposed.cache_status.cacheable,
        proposed.cache_status.cached,
    )?;
    let phase = match proposed.phase {
        None => current.phase,
        Some(to) => Some(CachePhase::transition(current.phase, to, &cache_status)?),
    };
    Ok(DatasetStatus {
        cache_status,
        phase,
        ..proposed
    })
}

impl DatasetStatus {
    /// See [`admit_status`]
    pub fn admit(&self, proposed: DatasetStatus) -> Result<DatasetStatus, Error> {
        admit_status(self, proposed)
    }

    /// Copy of this status moved to `Terminating`; only the deletion path calls this
    pub fn terminating(&self) -> DatasetStatus {
        DatasetStatus {
            phase: Some(CachePhase::Terminating),
            ..self.clone()
        }
    }

    /// Whether the cache has started filling from the current mount point
    pub fn loading_started(&self) -> bool {
        !matches!(self.phase, None | Some(CachePhase::Planning))
            || self.cache_status.cached > ByteQuantity::ZERO
            || self.observed_mount_point.is_some()
    }

    /// Whether the dataset is `Ready`
    pub fn is_ready(&self) -> bool {
        self.phase == Some(CachePhase::Ready)
    }

    /// Bytes an autoscaler still needs to place
    pub fn need_more_for_cache(&self) -> ByteQuantity {
        self.cache_status.need_more_for_cache
    }

    /// Fraction of the dataset cached
    pub fn cached_ratio(&self) -> CachedRatio {
        self.cache_status.cached_percentage
    }
}

impl Dataset {
    /// Namespaced identity
    pub fn key(&self) -> DatasetKey {
        DatasetKey::from_dataset(self)
    }

    /// Committed status, or an empty one before the controller's first write
    pub fn status_or_default(&self) -> DatasetStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Namespaced identity of a Dataset
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl DatasetKey {
    /// Build a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Dataset object
    pub fn from_dataset(ds: &Dataset) -> Self {
        Self {
            namespace: ds.namespace().unwrap_or_default(),
            name: ds.name_any(),
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
