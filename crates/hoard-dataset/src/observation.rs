//! Mount-status observations and their aggregation into cache counters
//!
//! Cache workers report per-node cached bytes; the mount driver reports
//! the dataset size. Aggregation keeps one report per node, drops nodes the
//! affinity excludes, and sums the rest.

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use hoard_common::crd::{CachePhase, CacheStatus, Dataset, DatasetSpec, DatasetStatus};
use hoard_common::quantity::ByteQuantity;
use hoard_common::{Error, Result};

/// Cached bytes reported by one node
#[derive(Clone, Debug, PartialEq)]
pub struct NodeCacheReport {
    /// Node name
    pub node: String,
    /// Node labels at observation time
    pub labels: BTreeMap<String, String>,
    /// Bytes of this dataset cached on the node
    pub cached: ByteQuantity,
}

/// Raw observation from the mount-status collaborator
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MountObservation {
    /// Discovered logical size
    pub total: ByteQuantity,
    /// Size reported by the source filesystem
    pub ufs_total: ByteQuantity,
    /// Bytes currently eligible for caching
    pub cacheable: ByteQuantity,
    /// Per-node reports; a later report for the same node replaces an earlier one
    pub nodes: Vec<NodeCacheReport>,
}

/// Observation reduced to validated counters
#[derive(Clone, Debug, PartialEq)]
pub struct CacheObservation {
    /// Discovered logical size
    pub total: ByteQuantity,
    /// Size reported by the source filesystem
    pub ufs_total: ByteQuantity,
    /// Normalized cache counters
    pub cache: CacheStatus,
}

/// Reduce a mount observation to cache counters for `spec`
pub fn aggregate(spec: &DatasetSpec, observation: &MountObservation) -> Result<CacheObservation> {
    let mut latest: BTreeMap<&str, &NodeCacheReport> = BTreeMap::new();
    for report in &observation.nodes {
        latest.insert(report.node.as_str(), report);
    }

    let mut cached = ByteQuantity::ZERO;
    for report in latest.values().filter(|r| spec.allows_node(&r.labels)) {
        cached = cached.checked_add(report.cached).ok_or_else(|| {
            Error::inconsistent_cache(
                u64::MAX,
                observation.cacheable.bytes(),
                observation.total.bytes(),
            )
        })?;
    }

    let cache = CacheStatus::derive(observation.total, observation.cacheable, cached)?;
    Ok(CacheObservation {
        total: observation.total,
        ufs_total: observation.ufs_total,
        cache,
    })
}

impl CacheObservation {
    /// `Ready` once everything cacheable is cached
    pub fn desired_phase(&self) -> CachePhase {
        if self.cache.is_fully_cached() {
            CachePhase::Ready
        } else {
            CachePhase::Loading
        }
    }

    /// Status to propose for this observation
    pub fn to_status(&self, generation: Option<i64>, mount_point: &str) -> DatasetStatus {
        DatasetStatus {
            total: self.total,
            ufs_total: self.ufs_total,
            cache_status: self.cache.clone(),
            phase: Some(self.desired_phase()),
            observed_generation: generation,
            observed_mount_point: Some(mount_point.to_string()),
            message: None,
        }
    }
}

/// Source of mount and per-node cache progress
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MountStatusProvider: Send + Sync {
    /// Current observation, `None` before the workers report anything
    async fn observe(&self, dataset: &Dataset) -> Result<Option<MountObservation>>;
}

/// Progress of releasing cached copies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownState {
    /// Workers have not acknowledged yet
    Pending,
    /// All cached copies are gone
    Released,
}

/// Asks cache workers to drop their copies of a dataset
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheTeardown: Send + Sync {
    /// Request release (idempotent) and report whether it finished
    async fn release(&self, dataset: &Dataset) -> Result<TeardownState>;
}
