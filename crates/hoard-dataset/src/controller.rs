//! Dataset reconciliation controller
//!
//! Drives a Dataset through its lifecycle:
//! - no report yet → `Loading` with empty counters
//! - partial cache → `Loading`, counters refreshed on every pass
//! - `cached == cacheable` → `Ready`, periodic re-check
//! - invalidation (source growth, node loss) → back to `Loading`
//! - deletion → `Terminating`, wait for cache workers, drop finalizer
//!
//! Every status write goes through [`DatasetClient`], so the phase rules and
//! the byte invariant hold for the controller the same as for anyone else.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource};
use tracing::{debug, info, instrument, warn};

use hoard_common::crd::{CachePhase, Dataset, DatasetStatus};
use hoard_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use hoard_common::retry::RetryConfig;
use hoard_common::{Error, Result};

use crate::client::DatasetClient;
use crate::observation::{aggregate, CacheTeardown, MountStatusProvider, TeardownState};
use crate::report::ConfigMapReports;
use crate::store::{DatasetStore, KubeDatasetStore};

/// Finalizer held until cache workers release their copies
pub const DATASET_FINALIZER: &str = "data.hoard.dev/cache-release";

/// Reporting component on published events
pub const CONTROLLER_NAME: &str = "hoard-dataset-controller";

const RETRYABLE_ERROR_REQUEUE: Duration = Duration::from_secs(5);
const PERMANENT_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Controller tuning
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Re-check interval while loading
    pub loading_requeue: Duration,
    /// Re-check interval once ready
    pub ready_requeue: Duration,
    /// Re-check interval while waiting for cache release
    pub teardown_requeue: Duration,
    /// Budget for status read-modify-write retries
    pub status_retry: RetryConfig,
    /// Restrict the controller to one namespace
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            loading_requeue: Duration::from_secs(10),
            ready_requeue: Duration::from_secs(60),
            teardown_requeue: Duration::from_secs(10),
            status_retry: RetryConfig::with_max_attempts(5),
            watch_namespace: None,
        }
    }
}

/// Shared state for reconciliation
pub struct Context {
    /// Validating Dataset access
    pub client: DatasetClient,
    /// Source of cache progress
    pub mount_status: Arc<dyn MountStatusProvider>,
    /// Releases cached copies on deletion
    pub teardown: Arc<dyn CacheTeardown>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Tuning
    pub config: ControllerConfig,
}

impl Context {
    /// Builder with Kubernetes-backed defaults for every collaborator
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context over in-process collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn DatasetStore>,
        mount_status: Arc<dyn MountStatusProvider>,
        teardown: Arc<dyn CacheTeardown>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let config = ControllerConfig {
            status_retry: RetryConfig::immediate(5),
            ..Default::default()
        };
        Self {
            client: DatasetClient::new(store, config.status_retry.clone()),
            mount_status,
            teardown,
            events,
            config,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    store: Option<Arc<dyn DatasetStore>>,
    mount_status: Option<Arc<dyn MountStatusProvider>>,
    teardown: Option<Arc<dyn CacheTeardown>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: ControllerConfig::default(),
            store: None,
            mount_status: None,
            teardown: None,
            events: None,
        }
    }

    /// Override tuning
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Dataset store
    pub fn store(mut self, store: Arc<dyn DatasetStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the mount-status collaborator
    pub fn mount_status(mut self, provider: Arc<dyn MountStatusProvider>) -> Self {
        self.mount_status = Some(provider);
        self
    }

    /// Override the teardown collaborator
    pub fn teardown(mut self, teardown: Arc<dyn CacheTeardown>) -> Self {
        self.teardown = Some(teardown);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let reports = Arc::new(ConfigMapReports::new(self.client.clone()));
        let store: Arc<dyn DatasetStore> = match self.store {
            Some(store) => store,
            None => Arc::new(KubeDatasetStore::new(
                self.client.clone(),
                self.config.watch_namespace.clone(),
            )),
        };
        let mount_status: Arc<dyn MountStatusProvider> = match self.mount_status {
            Some(provider) => provider,
            None => reports.clone(),
        };
        let teardown: Arc<dyn CacheTeardown> = match self.teardown {
            Some(teardown) => teardown,
            None => reports,
        };
        let events: Arc<dyn EventPublisher> = match self.events {
            Some(events) => events,
            None => Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)),
        };
        Context {
            client: DatasetClient::new(store, self.config.status_retry.clone()),
            mount_status,
            teardown,
            events,
            config: self.config,
        }
    }
}

fn has_finalizer(dataset: &Dataset) -> bool {
    dataset
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == DATASET_FINALIZER))
}

/// Observation failures that need the collaborator to fix its report
fn is_rejected_observation(err: &Error) -> bool {
    matches!(
        err,
        Error::InvalidQuantity { .. } | Error::InconsistentCacheState { .. }
    ) || matches!(err, Error::Collaborator { retryable: false, .. })
}

async fn publish(
    ctx: &Context,
    dataset: &Dataset,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&dataset.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Record a human-readable problem in `status.message`, leaving counters and phase alone
async fn record_message(ctx: &Context, dataset: &Dataset, message: String) -> Result<()> {
    let current = dataset.status.as_ref().and_then(|s| s.message.as_deref());
    if current == Some(message.as_str()) {
        return Ok(());
    }
    ctx.client
        .update_status_with_retry(&dataset.key(), |latest| {
            let mut status = latest.status_or_default();
            status.message = Some(message.clone());
            status.phase = None;
            Ok(status)
        })
        .await
        .map(|_| ())
}

/// Reconcile a Dataset toward its observed cache state
#[instrument(skip(dataset, ctx), fields(dataset = %dataset.key()))]
pub async fn reconcile(dataset: Arc<Dataset>, ctx: Arc<Context>) -> Result<Action> {
    if dataset.is_deleting() {
        return reconcile_deletion(&dataset, &ctx).await;
    }

    let dataset = if has_finalizer(&dataset) {
        dataset.as_ref().clone()
    } else {
        debug!("adding cache-release finalizer");
        ctx.client
            .store()
            .add_finalizer(&dataset, DATASET_FINALIZER)
            .await?
    };

    if let Err(e) = dataset.spec.validate() {
        let e = e.with_dataset(dataset.key());
        warn!(error = %e, "spec validation failed");
        publish(
            &ctx,
            &dataset,
            EventType::Warning,
            reasons::VALIDATION_FAILED,
            actions::RECONCILE,
            e.to_string(),
        )
        .await;
        record_message(&ctx, &dataset, e.to_string()).await?;
        return Ok(Action::await_change());
    }

    let status = dataset.status_or_default();
    if let Some(observed) = status.observed_mount_point.as_deref() {
        if observed != dataset.spec.mount_point {
            let note = format!(
                "mountPoint changed from {} to {} after loading began; recreate the Dataset to load a new source",
                observed, dataset.spec.mount_point
            );
            warn!(observed, requested = %dataset.spec.mount_point, "mountPoint changed after loading began");
            publish(
                &ctx,
                &dataset,
                EventType::Warning,
                reasons::MOUNT_POINT_CHANGED,
                actions::RECONCILE,
                note.clone(),
            )
            .await;
            record_message(&ctx, &dataset, note).await?;
            return Ok(Action::await_change());
        }
    }

    let observed = match ctx.mount_status.observe(&dataset).await {
        Ok(Some(raw)) => aggregate(&dataset.spec, &raw),
        Ok(None) => return start_loading(&dataset, &status, &ctx).await,
        Err(e) => Err(e),
    };
    let observed = match observed {
        Ok(observed) => observed,
        Err(e) if is_rejected_observation(&e) => {
            let e = e.with_dataset(dataset.key());
            warn!(error = %e, "rejecting mount observation");
            publish(
                &ctx,
                &dataset,
                EventType::Warning,
                reasons::OBSERVATION_REJECTED,
                actions::OBSERVE,
                e.to_string(),
            )
            .await;
            record_message(&ctx, &dataset, e.to_string()).await?;
            return Ok(Action::requeue(ctx.config.loading_requeue));
        }
        Err(e) => return Err(e),
    };

    let desired = observed.to_status(dataset.metadata.generation, &dataset.spec.mount_point);
    let next_phase = observed.desired_phase();
    let unchanged = status
        .admit(desired.clone())
        .is_ok_and(|admitted| admitted == status);

    if unchanged {
        debug!(phase = %next_phase, "status already current");
    } else {
        let written = ctx
            .client
            .update_status_with_retry(&dataset.key(), |_| Ok(desired.clone()))
            .await?;
        publish_phase_change(&ctx, &written, status.phase, next_phase).await;
    }

    Ok(match next_phase {
        CachePhase::Ready => Action::requeue(ctx.config.ready_requeue),
        _ => Action::requeue(ctx.config.loading_requeue),
    })
}

/// First pass before any worker has reported
async fn start_loading(dataset: &Dataset, status: &DatasetStatus, ctx: &Context) -> Result<Action> {
    if status.phase.is_none() {
        let generation = dataset.metadata.generation;
        let written = ctx
            .client
            .update_status_with_retry(&dataset.key(), |latest| {
                let mut next = latest.status_or_default();
                next.phase = Some(CachePhase::Loading);
                next.observed_generation = generation;
                Ok(next)
            })
            .await?;
        publish_phase_change(ctx, &written, None, CachePhase::Loading).await;
    } else {
        debug!("waiting for first cache report");
    }
    Ok(Action::requeue(ctx.config.loading_requeue))
}

async fn publish_phase_change(
    ctx: &Context,
    dataset: &Dataset,
    previous: Option<CachePhase>,
    next: CachePhase,
) {
    let status = dataset.status_or_default();
    let progress = format!(
        "cached {} of {} cacheable ({} total)",
        status.cache_status.cached, status.cache_status.cacheable, status.total
    );
    match (previous, next) {
        (Some(CachePhase::Ready), CachePhase::Ready) | (Some(CachePhase::Loading), CachePhase::Loading) => {}
        (_, CachePhase::Ready) => {
            info!(%progress, "dataset ready");
            publish(ctx, dataset, EventType::Normal, reasons::CACHE_READY, actions::RECONCILE, progress).await;
        }
        (Some(CachePhase::Ready), CachePhase::Loading) => {
            info!(%progress, "cache invalidated, reloading");
            publish(ctx, dataset, EventType::Warning, reasons::CACHE_INVALIDATED, actions::RECONCILE, progress).await;
        }
        (_, CachePhase::Loading) => {
            info!(%progress, "dataset loading");
            publish(ctx, dataset, EventType::Normal, reasons::CACHE_LOADING, actions::RECONCILE, progress).await;
        }
        (_, phase) => debug!(%phase, "no event for phase"),
    }
}

/// Deletion: mark `Terminating`, wait for cache release, then let go
async fn reconcile_deletion(dataset: &Dataset, ctx: &Context) -> Result<Action> {
    if !has_finalizer(dataset) {
        return Ok(Action::await_change());
    }

    if dataset.status_or_default().phase != Some(CachePhase::Terminating) {
        ctx.client.mark_terminating(&dataset.key()).await?;
        publish(
            ctx,
            dataset,
            EventType::Normal,
            reasons::TEARDOWN_STARTED,
            actions::TEARDOWN,
            "waiting for cache workers to release cached copies".to_string(),
        )
        .await;
    }

    match ctx.teardown.release(dataset).await? {
        TeardownState::Released => {
            ctx.client
                .store()
                .remove_finalizer(dataset, DATASET_FINALIZER)
                .await?;
            info!("cache released, finalizer removed");
            publish(
                ctx,
                dataset,
                EventType::Normal,
                reasons::TEARDOWN_COMPLETE,
                actions::TEARDOWN,
                "cached copies released".to_string(),
            )
            .await;
            Ok(Action::await_change())
        }
        TeardownState::Pending => {
            debug!("cache release pending");
            Ok(Action::requeue(ctx.config.teardown_requeue))
        }
    }
}

/// Requeue failed reconciles: quickly for transient errors, slowly for the rest
pub fn error_policy(dataset: Arc<Dataset>, error: &Error, _ctx: Arc<Context>) -> Action {
    let retryable = error.is_retryable();
    warn!(dataset = %dataset.key(), error = %error, retryable, "reconcile failed");
    if retryable {
        Action::requeue(RETRYABLE_ERROR_REQUEUE)
    } else {
        Action::requeue(PERMANENT_ERROR_REQUEUE)
    }
}
