//! Shared types for hoard: the Dataset CRD, byte quantities, errors, and
//! process-level utilities (telemetry, retry, events, type registry)

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod quantity;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of every hoard resource
pub const API_GROUP: &str = "data.hoard.dev";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "hoard-operator";
