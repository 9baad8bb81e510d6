//! In-process Dataset store with Kubernetes write semantics
//!
//! Writes to one key are serialized by the map's entry lock. Each committed
//! write takes the next value of a store-wide counter as its
//! `resourceVersion`, and the watch event is sent under the same lock that
//! hands out the version, so watchers see versions strictly increasing.
//! `generation` moves only when the spec changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::mapref::entry::{Entry, OccupiedEntry};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use hoard_common::crd::{Dataset, DatasetKey};
use hoard_common::{Error, Result};

use super::{base_version, DatasetStore, WatchEvent};

const WATCH_BUFFER: usize = 256;

/// Version counter and watch fan-out, always taken together
struct Sequencer {
    last_version: u64,
    events: broadcast::Sender<WatchEvent>,
}

/// Dataset store held in memory
pub struct InMemoryDatasetStore {
    objects: DashMap<DatasetKey, Dataset>,
    sequencer: Mutex<Sequencer>,
    uids: AtomicU64,
}

impl Default for InMemoryDatasetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatasetStore {
    /// Empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: DashMap::new(),
            sequencer: Mutex::new(Sequencer {
                last_version: 0,
                events,
            }),
            uids: AtomicU64::new(0),
        }
    }

    /// Stamp `object` with the next version and announce it. Callers hold the
    /// entry lock for the object's key.
    fn commit(&self, object: &mut Dataset, event: fn(Dataset) -> WatchEvent) -> Dataset {
        let mut seq = self.sequencer.lock().unwrap_or_else(PoisonError::into_inner);
        seq.last_version += 1;
        object.metadata.resource_version = Some(seq.last_version.to_string());
        let committed = object.clone();
        // No receivers is fine
        let _ = seq.events.send(event(committed.clone()));
        committed
    }

    /// Run a version-checked write against the stored object
    fn write_checked<F>(&self, dataset: &Dataset, apply: F) -> Result<Dataset>
    where
        F: FnOnce(&mut Dataset),
    {
        let key = dataset.key();
        let base = base_version(dataset)?;

        let mut stored = self
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;

        let current = stored.metadata.resource_version.clone();
        if current.as_deref() != Some(base.as_str()) {
            debug!(dataset = %key, base = %base, current = ?current, "rejecting stale write");
            return Err(Error::stale_write(key.to_string(), base, current));
        }

        apply(stored.value_mut());
        Ok(self.commit(stored.value_mut(), WatchEvent::Applied))
    }

    /// Drop an entry whose deletion is no longer held by finalizers
    fn remove_released(&self, entry: OccupiedEntry<'_, DatasetKey, Dataset>) {
        let mut gone = entry.get().clone();
        self.commit(&mut gone, WatchEvent::Deleted);
        let (key, _) = entry.remove_entry();
        debug!(dataset = %key, "object removed");
    }
}

#[async_trait]
impl DatasetStore for InMemoryDatasetStore {
    async fn create(&self, mut dataset: Dataset) -> Result<Dataset> {
        if dataset.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return Err(Error::invalid_spec_field("metadata.name", "name is required"));
        }
        if dataset.metadata.namespace.is_none() {
            dataset.metadata.namespace = Some("default".to_string());
        }
        let key = dataset.key();

        match self.objects.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists(key.to_string())),
            Entry::Vacant(slot) => {
                let uid = self.uids.fetch_add(1, Ordering::Relaxed) + 1;
                dataset.metadata.uid = Some(format!("{}-{}", key.name, uid));
                dataset.metadata.generation = Some(1);
                dataset.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
                dataset.metadata.deletion_timestamp = None;
                dataset.status = None;
                let mut stored = slot.insert(dataset);
                Ok(self.commit(stored.value_mut(), WatchEvent::Applied))
            }
        }
    }

    async fn get(&self, key: &DatasetKey) -> Result<Option<Dataset>> {
        Ok(self.objects.get(key).map(|entry| entry.value().clone()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Dataset>> {
        let mut items: Vec<Dataset> = self
            .objects
            .iter()
            .filter(|entry| entry.key().namespace == namespace)
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by_key(|ds| ds.key());
        Ok(items)
    }

    async fn update_spec(&self, dataset: &Dataset) -> Result<Dataset> {
        self.write_checked(dataset, |stored| {
            if stored.spec != dataset.spec {
                stored.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
                stored.spec = dataset.spec.clone();
            }
        })
    }

    async fn update_status(&self, dataset: &Dataset) -> Result<Dataset> {
        self.write_checked(dataset, |stored| {
            stored.status = dataset.status.clone();
        })
    }

    async fn add_finalizer(&self, dataset: &Dataset, finalizer: &str) -> Result<Dataset> {
        let key = dataset.key();
        let mut stored = self
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(stored.clone());
        }
        finalizers.push(finalizer.to_string());
        Ok(self.commit(stored.value_mut(), WatchEvent::Applied))
    }

    async fn remove_finalizer(&self, dataset: &Dataset, finalizer: &str) -> Result<()> {
        let Entry::Occupied(mut entry) = self.objects.entry(dataset.key()) else {
            return Ok(());
        };
        let Some(finalizers) = entry.get_mut().metadata.finalizers.as_mut() else {
            return Ok(());
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        if finalizers.len() == before {
            return Ok(());
        }

        let released = finalizers.is_empty() && entry.get().is_deleting();
        if released {
            debug!(dataset = %entry.key(), "finalizers cleared");
            self.remove_released(entry);
        } else {
            self.commit(entry.get_mut(), WatchEvent::Applied);
        }
        Ok(())
    }

    async fn delete(&self, key: &DatasetKey) -> Result<()> {
        let Entry::Occupied(mut entry) = self.objects.entry(key.clone()) else {
            return Err(Error::not_found(key.to_string()));
        };
        let has_finalizers = entry
            .get()
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());

        if !has_finalizers {
            self.remove_released(entry);
        } else if !entry.get().is_deleting() {
            debug!(dataset = %key, "deletion deferred until finalizers are removed");
            let stored = entry.get_mut();
            stored.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            self.commit(stored, WatchEvent::Applied);
        }
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent> {
        let receiver = self
            .sequencer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .subscribe();
        BroadcastStream::new(receiver)
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use hoard_common::crd::{CachePhase, DatasetSpec, DatasetStatus};

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

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = InMemoryDatasetStore::new();
        let created = store.create(dataset("imagenet")).await.unwrap();
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.resource_version.is_some());
        assert!(created.status.is_none());

        let err = store.create(dataset("imagenet")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn generation_moves_only_on_spec_change() {
        let store = InMemoryDatasetStore::new();
        let created = store.create(dataset("imagenet")).await.unwrap();

        let mut with_status = created.clone();
        with_status.status = Some(DatasetStatus {
            phase: Some(CachePhase::Loading),
            ..Default::default()
        });
        let after_status = store.update_status(&with_status).await.unwrap();
        assert_eq!(after_status.metadata.generation, Some(1));
        assert_ne!(after_status.metadata.resource_version, created.metadata.resource_version);

        let mut edited = after_status.clone();
        edited.spec.max_replicas = Some(3);
        let after_spec = store.update_spec(&edited).await.unwrap();
        assert_eq!(after_spec.metadata.generation, Some(2));
        assert_eq!(
            after_spec.status.and_then(|s| s.phase),
            Some(CachePhase::Loading)
        );
    }

    #[tokio::test]
    async fn stale_base_version_is_rejected() {
        let store = InMemoryDatasetStore::new();
        let created = store.create(dataset("imagenet")).await.unwrap();
        store.update_status(&created).await.unwrap();

        let err = store.update_status(&created).await.unwrap_err();
        match err {
            Error::StaleWrite { base, current, .. } => {
                assert_eq!(Some(base), created.metadata.resource_version);
                assert!(current.is_some());
            }
            other => panic!("expected StaleWrite, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unversioned_write_is_stale() {
        let store = InMemoryDatasetStore::new();
        store.create(dataset("imagenet")).await.unwrap();
        let err = store.update_status(&dataset("imagenet")).await.unwrap_err();
        assert!(err.is_stale_write());
    }

    #[tokio::test]
    async fn write_to_missing_object_is_not_found() {
        let store = InMemoryDatasetStore::new();
        let mut ghost = dataset("ghost");
        ghost.metadata.resource_version = Some("1".to_string());
        assert!(matches!(
            store.update_status(&ghost).await,
            Err(Error::NotFound { .. })
        ));
        assert!(store.delete(&ghost.key()).await.is_err());
    }

    #[tokio::test]
    async fn finalizer_defers_deletion() {
        let store = InMemoryDatasetStore::new();
        let created = store.create(dataset("imagenet")).await.unwrap();
        let key = created.key();

        let held = store.add_finalizer(&created, "data.hoard.dev/cache-release").await.unwrap();
        let again = store.add_finalizer(&held, "data.hoard.dev/cache-release").await.unwrap();
        assert_eq!(again.metadata.finalizers.as_ref().map(Vec::len), Some(1));
        assert_eq!(again.metadata.resource_version, held.metadata.resource_version);

        store.delete(&key).await.unwrap();
        let deleting = store.get(&key).await.unwrap().unwrap();
        assert!(deleting.is_deleting());

        store
            .remove_finalizer(&deleting, "data.hoard.dev/cache-release")
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_without_finalizers_removes_immediately() {
        let store = InMemoryDatasetStore::new();
        let created = store.create(dataset("imagenet")).await.unwrap();
        store.delete(&created.key()).await.unwrap();
        assert!(store.get(&created.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_namespace_scoped_and_sorted() {
        let store = InMemoryDatasetStore::new();
        store.create(dataset("b")).await.unwrap();
        store.create(dataset("a")).await.unwrap();
        let mut other = dataset("c");
        other.metadata.namespace = Some("other".to_string());
        store.create(other).await.unwrap();

        let names: Vec<_> = store
            .list("ml")
            .await
            .unwrap()
            .into_iter()
            .map(|ds| ds.key().name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn watch_streams_committed_changes() {
        let store = InMemoryDatasetStore::new();
        let mut events = store.watch();

        let created = store.create(dataset("imagenet")).await.unwrap();
        store.delete(&created.key()).await.unwrap();

        match events.next().await {
            Some(WatchEvent::Applied(ds)) => assert_eq!(ds.key(), created.key()),
            other => panic!("expected Applied, got {:?}", other),
        }
        match events.next().await {
            Some(WatchEvent::Deleted(ds)) => assert_eq!(ds.key(), created.key()),
            other => panic!("expected Deleted, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_writers_are_watched_in_version_order() {
        let store = Arc::new(InMemoryDatasetStore::new());
        let mut keys = Vec::new();
        for name in ["a", "b", "c"] {
            keys.push(store.create(dataset(name)).await.unwrap().key());
        }
        let mut events = store.watch();

        let mut writers = Vec::new();
        for i in 0..12 {
            let store = store.clone();
            let key = keys[i % keys.len()].clone();
            writers.push(tokio::spawn(async move {
                let mut landed = 0;
                while landed < 10 {
                    let current = store.get(&key).await.unwrap().unwrap();
                    let mut next = current.clone();
                    next.status = Some(DatasetStatus {
                        message: Some(format!("writer {} pass {}", i, landed)),
                        ..Default::default()
                    });
                    match store.update_status(&next).await {
                        Ok(_) => landed += 1,
                        Err(e) if e.is_stale_write() => tokio::task::yield_now().await,
                        Err(e) => panic!("unexpected error: {:?}", e),
                    }
                }
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = 0u64;
        for _ in 0..120 {
            let event = events.next().await.unwrap();
            let version: u64 = event
                .dataset()
                .metadata
                .resource_version
                .as_deref()
                .unwrap()
                .parse()
                .unwrap();
            assert!(version > last, "version {} after {}", version, last);
            last = version;
        }
    }

    #[tokio::test]
    async fn deletion_event_carries_a_new_version() {
        let store = InMemoryDatasetStore::new();
        let created = store.create(dataset("imagenet")).await.unwrap();
        let mut events = store.watch();
        store.delete(&created.key()).await.unwrap();

        let deleted = events.next().await.unwrap();
        assert!(matches!(deleted, WatchEvent::Deleted(_)));
        assert_ne!(
            deleted.dataset().metadata.resource_version,
            created.metadata.resource_version
        );
    }
}
