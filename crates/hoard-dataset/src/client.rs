//! Validating access to Dataset objects
//!
//! Every spec write is validated and every status write is admitted against
//! the committed status before it reaches the store. Nothing rejected here
//! is ever partially applied.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use hoard_common::crd::{CachePhase, Dataset, DatasetKey, DatasetStatus};
use hoard_common::retry::{retry_with_backoff_if, RetryConfig};
use hoard_common::{Error, Result};

use crate::store::DatasetStore;

/// Front door for reading and writing Datasets
#[derive(Clone)]
pub struct DatasetClient {
    store: Arc<dyn DatasetStore>,
    retry: RetryConfig,
}

impl DatasetClient {
    /// Client over `store`; `retry` bounds status read-modify-write loops
    pub fn new(store: Arc<dyn DatasetStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn DatasetStore> {
        &self.store
    }

    /// Validate and create
    pub async fn create(&self, dataset: Dataset) -> Result<Dataset> {
        dataset
            .spec
            .validate()
            .map_err(|e| e.with_dataset(dataset.key()))?;
        self.store.create(dataset).await
    }

    /// Last committed state
    pub async fn get(&self, key: &DatasetKey) -> Result<Option<Dataset>> {
        self.store.get(key).await
    }

    async fn require(&self, key: &DatasetKey) -> Result<Dataset> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| Error::not_found(key.to_string()))
    }

    /// Validate `proposed.spec` as an update of the committed object and write it.
    ///
    /// Fails with `StaleWrite` before validating if `proposed` was not read
    /// from the latest version.
    pub async fn update_spec(&self, proposed: &Dataset) -> Result<Dataset> {
        let key = proposed.key();
        let current = self.require(&key).await?;

        if current.metadata.resource_version != proposed.metadata.resource_version {
            return Err(Error::stale_write(
                key.to_string(),
                proposed
                    .metadata
                    .resource_version
                    .clone()
                    .unwrap_or_else(|| "<none>".to_string()),
                current.metadata.resource_version.clone(),
            ));
        }

        current
            .spec
            .validate_update(&proposed.spec, current.status.as_ref())
            .map_err(|e| e.with_dataset(&key))?;
        self.store.update_spec(proposed).await
    }

    /// Admit `proposed` against `base`'s status and write it once.
    pub async fn propose_status(&self, base: &Dataset, proposed: DatasetStatus) -> Result<Dataset> {
        let admitted = base
            .status_or_default()
            .admit(proposed)
            .map_err(|e| e.with_dataset(base.key()))?;
        let mut next = base.clone();
        next.status = Some(admitted);
        self.store.update_status(&next).await
    }

    /// Read-modify-write a status until it lands.
    ///
    /// `modify` sees the latest committed object on every attempt. Only
    /// `StaleWrite` is retried; admission failures and `modify` errors are
    /// returned immediately.
    pub async fn update_status_with_retry<F>(&self, key: &DatasetKey, modify: F) -> Result<Dataset>
    where
        F: FnMut(&Dataset) -> Result<DatasetStatus> + Send,
    {
        let modify = &Mutex::new(modify);
        retry_with_backoff_if(
            &self.retry,
            "update-status",
            |e: &Error| e.is_stale_write(),
            move || async move {
                let current = self.require(key).await?;
                let proposed = {
                    let mut modify = modify.lock().unwrap_or_else(PoisonError::into_inner);
                    (*modify)(&current)?
                };
                self.propose_status(&current, proposed).await
            },
        )
        .await
    }

    /// Move a Dataset to `Terminating`. Only the deletion path uses this; it
    /// bypasses the phase rules, which never allow entering `Terminating`.
    pub async fn mark_terminating(&self, key: &DatasetKey) -> Result<Dataset> {
        retry_with_backoff_if(
            &self.retry,
            "mark-terminating",
            |e: &Error| e.is_stale_write(),
            || async move {
                let current = self.require(key).await?;
                let status = current.status_or_default();
                if status.phase == Some(CachePhase::Terminating) {
                    return Ok(current);
                }
                let mut next = current.clone();
                next.status = Some(status.terminating());
                let written = self.store.update_status(&next).await?;
                info!(dataset = %key, "dataset marked terminating");
                Ok(written)
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryDatasetStore, MockDatasetStore};
    use hoard_common::crd::{CacheStatus, DatasetSpec};
    use hoard_common::quantity::ByteQuantity;

    const GIB: u64 = 1 << 30;

    fn gib(n: u64) -> ByteQuantity {
        ByteQuantity::from_bytes(n * GIB)
    }

    fn dataset(name: &str) -> Dataset {
        let mut ds = Dataset::new(
            name,
            DatasetSpec {
                mount_point: "s3://bucket/data".to_string(),
                options: Default::default(),
                min_replicas: None,
                max_replicas: None,
                node_affinity: None,
            },
        );
        ds.metadata.namespace = Some("ml".to_string());
        ds
    }

    fn status(total: u64, cacheable: u64, cached: u64, phase: CachePhase) -> DatasetStatus {
        DatasetStatus {
            total: gib(total),
            ufs_total: gib(total),
            cache_status: CacheStatus {
                cached: gib(cached),
                cacheable: gib(cacheable),
                ..Default::default()
            },
            phase: Some(phase),
            ..Default::default()
        }
    }

    fn client(store: Arc<dyn DatasetStore>) -> DatasetClient {
        DatasetClient::new(store, RetryConfig::immediate(5))
    }

    #[tokio::test]
    async fn create_rejects_invalid_spec_with_identity() {
        let client = client(Arc::new(InMemoryDatasetStore::new()));
        let mut ds = dataset("imagenet");
        ds.spec.min_replicas = Some(3);
        ds.spec.max_replicas = Some(1);

        let err = client.create(ds).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec { .. }));
        assert_eq!(err.dataset(), Some("ml/imagenet"));
        assert!(client
            .get(&DatasetKey::new("ml", "imagenet"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rejected_status_leaves_committed_state() {
        let client = client(Arc::new(InMemoryDatasetStore::new()));
        let created = client.create(dataset("imagenet")).await.unwrap();
        let loaded = client
            .propose_status(&created, status(50, 40, 15, CachePhase::Loading))
            .await
            .unwrap();

        let err = client
            .propose_status(&loaded, status(50, 40, 15, CachePhase::Ready))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPhaseTransition { .. }));
        assert_eq!(err.dataset(), Some("ml/imagenet"));

        let err = client
            .propose_status(&loaded, status(50, 40, 45, CachePhase::Loading))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentCacheState { .. }));

        let committed = client.get(&loaded.key()).await.unwrap().unwrap();
        assert_eq!(committed.status, loaded.status);
        assert_eq!(
            committed.metadata.resource_version,
            loaded.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn mount_point_change_after_loading_is_rejected() {
        let client = client(Arc::new(InMemoryDatasetStore::new()));
        let created = client.create(dataset("imagenet")).await.unwrap();

        // Before any status, the mount point is still editable
        let mut early = created.clone();
        early.spec.mount_point = "s3://bucket/v2".to_string();
        let edited = client.update_spec(&early).await.unwrap();

        let loading = client
            .propose_status(&edited, status(50, 40, 0, CachePhase::Loading))
            .await
            .unwrap();
        let mut late = loading.clone();
        late.spec.mount_point = "s3://bucket/v3".to_string();
        let err = client.update_spec(&late).await.unwrap_err();
        assert!(matches!(err, Error::ImmutableFieldChanged { .. }));
        assert_eq!(err.dataset(), Some("ml/imagenet"));

        let mut rotated = loading.clone();
        rotated.spec.options.insert("secret.key", "rotated");
        client.update_spec(&rotated).await.unwrap();
    }

    #[tokio::test]
    async fn update_spec_from_stale_read_is_rejected() {
        let client = client(Arc::new(InMemoryDatasetStore::new()));
        let created = client.create(dataset("imagenet")).await.unwrap();
        client
            .propose_status(&created, status(50, 40, 0, CachePhase::Loading))
            .await
            .unwrap();

        let mut stale = created.clone();
        stale.spec.max_replicas = Some(2);
        assert!(client.update_spec(&stale).await.unwrap_err().is_stale_write());
    }

    #[tokio::test]
    async fn retry_loop_rereads_after_stale_write() {
        let base = {
            let mut ds = dataset("imagenet");
            ds.metadata.resource_version = Some("7".to_string());
            ds
        };

        let mut store = MockDatasetStore::new();
        let reads = base.clone();
        store
            .expect_get()
            .times(2)
            .returning(move |_| Ok(Some(reads.clone())));
        let mut seq = mockall::Sequence::new();
        store
            .expect_update_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ds| {
                Err(Error::stale_write(
                    ds.key().to_string(),
                    "7",
                    Some("8".to_string()),
                ))
            });
        store
            .expect_update_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ds| Ok(ds.clone()));

        let client = client(Arc::new(store));
        let mut calls = 0;
        let written = client
            .update_status_with_retry(&base.key(), |_| {
                calls += 1;
                Ok(status(50, 40, 40, CachePhase::Ready))
            })
            .await
            .unwrap();

        assert_eq!(calls, 2);
        assert!(written.status.unwrap().is_ready());
    }

    #[tokio::test]
    async fn retry_loop_gives_up_after_budget() {
        let mut store = MockDatasetStore::new();
        store.expect_get().returning(|key| {
            let mut ds = dataset(&key.name);
            ds.metadata.resource_version = Some("1".to_string());
            Ok(Some(ds))
        });
        store
            .expect_update_status()
            .times(3)
            .returning(|ds| Err(Error::stale_write(ds.key().to_string(), "1", None)));

        let client = DatasetClient::new(Arc::new(store), RetryConfig::immediate(3));
        let err = client
            .update_status_with_retry(&DatasetKey::new("ml", "imagenet"), |_| {
                Ok(status(50, 40, 10, CachePhase::Loading))
            })
            .await
            .unwrap_err();
        assert!(err.is_stale_write());
    }

    #[tokio::test]
    async fn admission_errors_are_not_retried() {
        let client = client(Arc::new(InMemoryDatasetStore::new()));
        let created = client.create(dataset("imagenet")).await.unwrap();

        let mut calls = 0;
        let err = client
            .update_status_with_retry(&created.key(), |_| {
                calls += 1;
                Ok(status(50, 60, 0, CachePhase::Loading))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentCacheState { .. }));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn modify_errors_end_the_loop() {
        let client = client(Arc::new(InMemoryDatasetStore::new()));
        let created = client.create(dataset("imagenet")).await.unwrap();

        let mut calls = 0;
        let err = client
            .update_status_with_retry(&created.key(), |current| {
                calls += 1;
                Err(Error::not_found(current.key().to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn terminating_is_written_once_and_sticks() {
        let client = client(Arc::new(InMemoryDatasetStore::new()));
        let created = client.create(dataset("imagenet")).await.unwrap();
        let loading = client
            .propose_status(&created, status(50, 40, 15, CachePhase::Loading))
            .await
            .unwrap();

        let terminating = client.mark_terminating(&loading.key()).await.unwrap();
        let st = terminating.status_or_default();
        assert_eq!(st.phase, Some(CachePhase::Terminating));
        assert_eq!(st.cache_status.cached, gib(15));

        let again = client.mark_terminating(&loading.key()).await.unwrap();
        assert_eq!(again.metadata.resource_version, terminating.metadata.resource_version);

        let err = client
            .propose_status(&again, status(50, 40, 15, CachePhase::Loading))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPhaseTransition { .. }));
    }
}
