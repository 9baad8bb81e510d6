//! Resource store seam for Dataset objects
//!
//! Every write carries the caller's base `metadata.resourceVersion`. A store
//! commits the write only if that version is still the latest, otherwise it
//! returns `StaleWrite` and the caller re-reads. Reads never block writers.

mod apiserver;
mod memory;

pub use self::apiserver::KubeDatasetStore;
pub use self::memory::InMemoryDatasetStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use hoard_common::crd::{Dataset, DatasetKey};
use hoard_common::{Error, Result};

/// Change notification from [`DatasetStore::watch`]
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// Object created or modified
    Applied(Dataset),
    /// Object removed from the store
    Deleted(Dataset),
}

impl WatchEvent {
    /// The object the event carries
    pub fn dataset(&self) -> &Dataset {
        match self {
            WatchEvent::Applied(ds) | WatchEvent::Deleted(ds) => ds,
        }
    }
}

/// Versioned storage for Dataset objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Create a new object; `AlreadyExists` if the key is taken
    async fn create(&self, dataset: Dataset) -> Result<Dataset>;

    /// Last committed state, `None` if absent
    async fn get(&self, key: &DatasetKey) -> Result<Option<Dataset>>;

    /// All objects in a namespace
    async fn list(&self, namespace: &str) -> Result<Vec<Dataset>>;

    /// Replace the spec, checked against `dataset.metadata.resourceVersion`
    async fn update_spec(&self, dataset: &Dataset) -> Result<Dataset>;

    /// Replace the status, checked against `dataset.metadata.resourceVersion`
    async fn update_status(&self, dataset: &Dataset) -> Result<Dataset>;

    /// Add a finalizer if missing
    async fn add_finalizer(&self, dataset: &Dataset, finalizer: &str) -> Result<Dataset>;

    /// Remove a finalizer; removing the last one from a deleting object
    /// removes the object
    async fn remove_finalizer(&self, dataset: &Dataset, finalizer: &str) -> Result<()>;

    /// Request deletion; objects with finalizers get a deletion timestamp
    /// and stay until the finalizers are removed
    async fn delete(&self, key: &DatasetKey) -> Result<()>;

    /// Stream of changes committed after the call
    fn watch(&self) -> BoxStream<'static, WatchEvent>;
}

/// Base version a write is checked against; an object that was never read
/// from the store cannot be written
pub(crate) fn base_version(dataset: &Dataset) -> Result<String> {
    dataset
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| Error::stale_write(dataset.key().to_string(), "<none>", None))
}
