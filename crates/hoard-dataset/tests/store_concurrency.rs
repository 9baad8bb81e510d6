//! Concurrent writers against one Dataset
//!
//! Two writers that read the same version race on the status subresource:
//! exactly one lands, the loser sees `StaleWrite` and succeeds after
//! re-reading.

use std::sync::Arc;

use futures::StreamExt;

use hoard_common::crd::{CachePhase, CacheStatus, Dataset, DatasetKey, DatasetStatus};
use hoard_common::quantity::ByteQuantity;
use hoard_common::retry::RetryConfig;
use hoard_common::Error;
use hoard_dataset::{DatasetClient, DatasetStore, InMemoryDatasetStore, WatchEvent};

const GIB: u64 = 1 << 30;

const DATASET_YAML: &str = r#"
apiVersion: data.hoard.dev/v1alpha1
kind: Dataset
metadata:
  name: imagenet
  namespace: ml
spec:
  mountPoint: s3://bucket/imagenet
  options:
    region: us-east-1
  minReplicas: 1
  maxReplicas: 3
"#;

fn gib(n: u64) -> ByteQuantity {
    ByteQuantity::from_bytes(n * GIB)
}

fn loading(total: u64, cacheable: u64, cached: u64) -> DatasetStatus {
    DatasetStatus {
        total: gib(total),
        ufs_total: gib(total),
        cache_status: CacheStatus {
            cached: gib(cached),
            cacheable: gib(cacheable),
            ..Default::default()
        },
        phase: Some(CachePhase::Loading),
        ..Default::default()
    }
}

async fn setup() -> (Arc<InMemoryDatasetStore>, DatasetClient, Dataset) {
    let store = Arc::new(InMemoryDatasetStore::new());
    let client = DatasetClient::new(store.clone(), RetryConfig::immediate(5));
    let ds: Dataset = serde_yaml::from_str(DATASET_YAML).unwrap();
    let created = client.create(ds).await.unwrap();
    (store, client, created)
}

// ==========================================================================
// Racing status writes
// ==========================================================================

#[tokio::test]
async fn one_of_two_writers_on_the_same_base_wins() {
    let (_store, client, base) = setup().await;
    let other = client.clone();

    let (first, second) = tokio::join!(
        client.propose_status(&base, loading(50, 40, 10)),
        other.propose_status(&base, loading(50, 40, 20)),
    );

    let outcomes = [first, second];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, Error::StaleWrite { .. }));
    assert!(loser.is_retryable());

    // The loser re-reads and tries again
    let latest = client.get(&base.key()).await.unwrap().unwrap();
    let written = client
        .propose_status(&latest, loading(50, 40, 30))
        .await
        .unwrap();
    assert_eq!(written.status_or_default().cache_status.cached, gib(30));
}

#[tokio::test]
async fn read_modify_write_retries_past_a_concurrent_writer() {
    let (store, client, base) = setup().await;
    let key = base.key();
    client
        .propose_status(&base, loading(50, 40, 10))
        .await
        .unwrap();

    let mut raced = false;
    let written = client
        .update_status_with_retry(&key, |current| {
            if !raced {
                raced = true;
                // Another writer commits between our read and our write
                let mut other = current.clone();
                other.status = Some(loading(50, 40, 12));
                futures::executor::block_on(store.update_status(&other))?;
            }
            let mut next = current.status_or_default();
            next.cache_status.cached = gib(next.cache_status.cached.bytes() / GIB + 5);
            next.phase = None;
            Ok(next)
        })
        .await
        .unwrap();

    // Second attempt built on the concurrent writer's 12Gi
    assert_eq!(written.status_or_default().cache_status.cached, gib(17));
    assert_eq!(written.status_or_default().need_more_for_cache(), gib(23));
}

#[tokio::test]
async fn rejected_status_is_never_partially_applied() {
    let (_store, client, base) = setup().await;
    let written = client
        .propose_status(&base, loading(50, 40, 10))
        .await
        .unwrap();

    let err = client
        .propose_status(&written, loading(50, 40, 45))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InconsistentCacheState { .. }));

    let current = client.get(&base.key()).await.unwrap().unwrap();
    assert_eq!(current.metadata.resource_version, written.metadata.resource_version);
    assert_eq!(current.status_or_default().cache_status.cached, gib(10));
}

// ==========================================================================
// Watch
// ==========================================================================

#[tokio::test]
async fn watchers_see_commits_in_order() {
    let store = Arc::new(InMemoryDatasetStore::new());
    let client = DatasetClient::new(store.clone(), RetryConfig::immediate(3));
    let mut events = store.watch();

    let ds: Dataset = serde_yaml::from_str(DATASET_YAML).unwrap();
    let created = client.create(ds).await.unwrap();
    client
        .propose_status(&created, loading(50, 40, 40))
        .await
        .unwrap();
    store.delete(&DatasetKey::new("ml", "imagenet")).await.unwrap();

    let first = events.next().await.unwrap();
    assert!(matches!(first, WatchEvent::Applied(_)));
    assert!(first.dataset().status.is_none());

    let second = events.next().await.unwrap();
    assert_eq!(
        second.dataset().status_or_default().cache_status.cached,
        gib(40)
    );

    let third = events.next().await.unwrap();
    assert!(matches!(third, WatchEvent::Deleted(_)));
    assert_eq!(third.dataset().key().to_string(), "ml/imagenet");
}
