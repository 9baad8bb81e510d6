//! Kubernetes Events for Dataset lifecycle milestones.
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! reconciliation.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event; failures are logged, not returned
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the event's reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event is about
    pub object: Option<String>,
    /// Whether this was a warning
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event note
    pub note: Option<String>,
}

/// In-memory publisher for tests and dry runs
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Everything published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Reasons published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                object: resource_ref.name.clone(),
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                action: action.to_string(),
                note,
            });
        }
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Cache is filling
    pub const CACHE_LOADING: &str = "CacheLoading";
    /// Everything cacheable is cached
    pub const CACHE_READY: &str = "CacheReady";
    /// Ready dataset regressed to Loading
    pub const CACHE_INVALIDATED: &str = "CacheInvalidated";
    /// Mount observation violated the cache invariant
    pub const OBSERVATION_REJECTED: &str = "ObservationRejected";
    /// Spec failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// mountPoint was edited after loading began
    pub const MOUNT_POINT_CHANGED: &str = "MountPointChanged";
    /// Deletion requested; waiting for cache workers
    pub const TEARDOWN_STARTED: &str = "TeardownStarted";
    /// Cache workers released their copies
    pub const TEARDOWN_COMPLETE: &str = "TeardownComplete";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Reconciliation of desired and observed state
    pub const RECONCILE: &str = "Reconcile";
    /// Reading mount status from cache workers
    pub const OBSERVE: &str = "Observe";
    /// Releasing cached copies on deletion
    pub const TEARDOWN: &str = "Teardown";
}
