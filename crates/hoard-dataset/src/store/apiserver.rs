//! Dataset store backed by the Kubernetes API server
//!
//! Spec and status writes replace the whole object (PUT), so fields the
//! caller dropped are dropped on the server too. The body carries the base
//! `resourceVersion`, which the API server treats as a precondition; a
//! mismatch comes back as 409 Conflict and is surfaced as `StaleWrite`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use serde_json::json;
use tracing::{debug, warn};

use hoard_common::crd::{Dataset, DatasetKey};
use hoard_common::{Error, Result};

use super::{base_version, DatasetStore, WatchEvent};

/// Dataset store using the cluster's API server
#[derive(Clone)]
pub struct KubeDatasetStore {
    client: Client,
    watch_namespace: Option<String>,
}

impl KubeDatasetStore {
    /// Store over every namespace, or only `watch_namespace` when set
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            watch_namespace,
        }
    }

    fn api(&self, namespace: &str) -> Api<Dataset> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_for(&self, key: &DatasetKey) -> Api<Dataset> {
        self.api(&key.namespace)
    }

    fn watch_api(&self) -> Api<Dataset> {
        match &self.watch_namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

/// Translate API errors for a versioned write on `key`
fn write_error(key: &DatasetKey, base: &str, err: kube::Error) -> Error {
    match api_code(&err) {
        Some(409) => Error::stale_write(key.to_string(), base, None),
        Some(404) => Error::not_found(key.to_string()),
        _ => Error::from(err),
    }
}

/// Base version and PUT body for a whole-object write
fn replacement(dataset: &Dataset) -> Result<(String, Vec<u8>)> {
    let base = base_version(dataset)?;
    let body = serde_json::to_vec(dataset)?;
    Ok((base, body))
}

#[async_trait]
impl DatasetStore for KubeDatasetStore {
    async fn create(&self, dataset: Dataset) -> Result<Dataset> {
        let key = dataset.key();
        self.api_for(&key)
            .create(&PostParams::default(), &dataset)
            .await
            .map_err(|e| match api_code(&e) {
                Some(409) => Error::already_exists(key.to_string()),
                _ => Error::from(e),
            })
    }

    async fn get(&self, key: &DatasetKey) -> Result<Option<Dataset>> {
        Ok(self.api_for(key).get_opt(&key.name).await?)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Dataset>> {
        let list = self.api(namespace).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn update_spec(&self, dataset: &Dataset) -> Result<Dataset> {
        let key = dataset.key();
        let base = base_version(dataset)?;
        self.api_for(&key)
            .replace(&key.name, &PostParams::default(), dataset)
            .await
            .map_err(|e| write_error(&key, &base, e))
    }

    async fn update_status(&self, dataset: &Dataset) -> Result<Dataset> {
        let key = dataset.key();
        let (base, body) = replacement(dataset)?;
        self.api_for(&key)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| write_error(&key, &base, e))
    }

    async fn add_finalizer(&self, dataset: &Dataset, finalizer: &str) -> Result<Dataset> {
        let key = dataset.key();
        let mut finalizers = dataset.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(dataset.clone());
        }
        finalizers.push(finalizer.to_string());

        let patch = json!({ "metadata": { "finalizers": finalizers } });
        debug!(dataset = %key, finalizer, "adding finalizer");
        self.api_for(&key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match api_code(&e) {
                Some(404) => Error::not_found(key.to_string()),
                _ => Error::from(e),
            })
    }

    async fn remove_finalizer(&self, dataset: &Dataset, finalizer: &str) -> Result<()> {
        let key = dataset.key();
        let finalizers: Vec<String> = dataset
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();

        let patch = json!({ "metadata": { "finalizers": finalizers } });
        debug!(dataset = %key, finalizer, "removing finalizer");
        match self
            .api_for(&key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &DatasetKey) -> Result<()> {
        self.api_for(key)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| match api_code(&e) {
                Some(404) => Error::not_found(key.to_string()),
                _ => Error::from(e),
            })
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent> {
        watcher::watcher(self.watch_api(), watcher::Config::default())
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Apply(ds)) | Ok(Event::InitApply(ds)) => Some(WatchEvent::Applied(ds)),
                    Ok(Event::Delete(ds)) => Some(WatchEvent::Deleted(ds)),
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => {
                        warn!(error = %e, "dataset watch error, watcher will retry");
                        None
                    }
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_common::crd::{
        CacheableNodeAffinity, DatasetSpec, DatasetStatus, NodeConstraint,
    };
    use kube::core::ErrorResponse;
    use serde_json::Value;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn conflict_maps_to_stale_write() {
        let key = DatasetKey::new("ml", "imagenet");
        let err = write_error(&key, "41", api_error(409));
        assert!(err.is_stale_write());
        assert_eq!(err.dataset(), Some("ml/imagenet"));
    }

    #[test]
    fn missing_object_maps_to_not_found() {
        let key = DatasetKey::new("ml", "imagenet");
        assert!(matches!(
            write_error(&key, "41", api_error(404)),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn other_api_errors_stay_kube_errors() {
        let key = DatasetKey::new("ml", "imagenet");
        let err = write_error(&key, "41", api_error(422));
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_retryable());
        assert!(write_error(&key, "41", api_error(503)).is_retryable());
    }

    fn stored(rv: &str) -> Dataset {
        let mut ds = Dataset::new(
            "imagenet",
            DatasetSpec {
                mount_point: "s3://bucket/imagenet".to_string(),
                options: [("region", "us-east-1"), ("secret", "s")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                min_replicas: Some(1),
                max_replicas: Some(3),
                node_affinity: Some(CacheableNodeAffinity::requiring(NodeConstraint::exists(
                    "ssd",
                ))),
            },
        );
        ds.metadata.namespace = Some("ml".to_string());
        ds.metadata.resource_version = Some(rv.to_string());
        ds.status = Some(DatasetStatus {
            message: Some("old rejection".to_string()),
            ..Default::default()
        });
        ds
    }

    #[test]
    fn replacement_carries_the_complete_new_state() {
        let mut edited = stored("7");
        edited.status.as_mut().unwrap().message = None;
        edited.spec.options = [("region".to_string(), "us-east-1".to_string())]
            .into_iter()
            .collect();
        edited.spec.max_replicas = None;
        edited.spec.node_affinity = Some(CacheableNodeAffinity::requiring(NodeConstraint::equals(
            "zone", "a",
        )));

        let (base, body) = replacement(&edited).unwrap();
        assert_eq!(base, "7");
        let body: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(body["metadata"]["resourceVersion"], "7");
        assert!(body["status"].get("message").is_none());
        assert_eq!(body["spec"]["options"], serde_json::json!({ "region": "us-east-1" }));
        assert!(body["spec"].get("maxReplicas").is_none());
        let required = body["spec"]["nodeAffinity"]["required"].as_object().unwrap();
        assert_eq!(required.keys().collect::<Vec<_>>(), vec!["equals"]);

        // What the server stores is exactly this body, and it decodes cleanly
        let decoded: Dataset = serde_json::from_value(body).unwrap();
        assert_eq!(decoded.spec, edited.spec);
        assert_eq!(decoded.status, edited.status);
    }

    #[test]
    fn replacement_needs_a_base_version() {
        let mut unread = stored("7");
        unread.metadata.resource_version = None;
        assert!(replacement(&unread).unwrap_err().is_stale_write());
    }
}
