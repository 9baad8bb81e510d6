//! Dataset runtime for hoard
//!
//! - [`store`]: versioned Dataset storage (apiserver or in-memory)
//! - [`client`]: validating access with status admission
//! - [`observation`] / [`report`]: cache progress from the workers
//! - [`controller`]: the reconciler

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod observation;
pub mod report;
pub mod store;

pub use client::DatasetClient;
pub use controller::{error_policy, reconcile, Context, ContextBuilder, ControllerConfig};
pub use observation::{CacheTeardown, MountObservation, MountStatusProvider, TeardownState};
pub use store::{DatasetStore, InMemoryDatasetStore, KubeDatasetStore, WatchEvent};
