//! Error types for hoard
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the dataset it concerns (when known) together with
//! the offending values, so a rejected write can be explained without
//! re-reading the resource.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for hoard operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Malformed or contradictory desired state
    #[error("invalid spec for {dataset}: {message}")]
    InvalidSpec {
        /// Dataset identity (`namespace/name`)
        dataset: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.minReplicas")
        field: Option<String>,
    },

    /// Unparseable size literal
    #[error("invalid quantity '{value}': {message}")]
    InvalidQuantity {
        /// The literal that failed to parse
        value: String,
        /// Why it was rejected
        message: String,
    },

    /// Proposed status violates `cached <= cacheable <= total`
    #[error(
        "inconsistent cache state for {dataset}: cached={cached} cacheable={cacheable} total={total}"
    )]
    InconsistentCacheState {
        /// Dataset identity (`namespace/name`)
        dataset: String,
        /// Proposed cached bytes
        cached: u64,
        /// Proposed cacheable bytes
        cacheable: u64,
        /// Proposed total bytes
        total: u64,
    },

    /// Illegal phase change
    #[error("invalid phase transition for {dataset}: {from} -> {to}: {reason}")]
    InvalidPhaseTransition {
        /// Dataset identity (`namespace/name`)
        dataset: String,
        /// Current phase ("none" for a fresh status)
        from: String,
        /// Requested phase
        to: String,
        /// Why the transition was refused
        reason: String,
    },

    /// Attempted mutation of a field that must not change once loading began
    #[error("immutable field {field} changed for {dataset}")]
    ImmutableFieldChanged {
        /// Dataset identity (`namespace/name`)
        dataset: String,
        /// Field path (e.g., "spec.mountPoint")
        field: String,
    },

    /// Optimistic-concurrency conflict; re-read and retry
    #[error("stale write for {dataset}: base version {base} is not the latest")]
    StaleWrite {
        /// Dataset identity (`namespace/name`)
        dataset: String,
        /// Version the writer based its update on
        base: String,
        /// Latest committed version, when the store knows it
        current: Option<String>,
    },

    /// Resource does not exist
    #[error("dataset {dataset} not found")]
    NotFound {
        /// Dataset identity (`namespace/name`)
        dataset: String,
    },

    /// Resource already exists
    #[error("dataset {dataset} already exists")]
    AlreadyExists {
        /// Dataset identity (`namespace/name`)
        dataset: String,
    },

    /// Mount-status or cache-worker collaborator failure
    #[error("collaborator error [{context}]: {message}")]
    Collaborator {
        /// Collaborator that failed (e.g., "mount-status", "teardown")
        context: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "store")
        context: String,
    },
}

impl Error {
    /// Create an invalid-spec error without dataset context
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec {
            dataset: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create an invalid-spec error pointing at a field path
    pub fn invalid_spec_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSpec {
            dataset: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid-quantity error
    pub fn invalid_quantity(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create an inconsistent-cache-state error from the offending byte counts
    pub fn inconsistent_cache(cached: u64, cacheable: u64, total: u64) -> Self {
        Self::InconsistentCacheState {
            dataset: UNKNOWN_CONTEXT.to_string(),
            cached,
            cacheable,
            total,
        }
    }

    /// Create an invalid-phase-transition error
    pub fn invalid_transition(
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidPhaseTransition {
            dataset: UNKNOWN_CONTEXT.to_string(),
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create an immutable-field error
    pub fn immutable_field(dataset: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ImmutableFieldChanged {
            dataset: dataset.into(),
            field: field.into(),
        }
    }

    /// Create a stale-write error
    pub fn stale_write(
        dataset: impl Into<String>,
        base: impl Into<String>,
        current: Option<String>,
    ) -> Self {
        Self::StaleWrite {
            dataset: dataset.into(),
            base: base.into(),
            current,
        }
    }

    /// Create a not-found error
    pub fn not_found(dataset: impl Into<String>) -> Self {
        Self::NotFound {
            dataset: dataset.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(dataset: impl Into<String>) -> Self {
        Self::AlreadyExists {
            dataset: dataset.into(),
        }
    }

    /// Create a retryable collaborator error
    pub fn collaborator(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Collaborator {
            context: context.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable collaborator error (e.g., malformed report)
    pub fn collaborator_permanent(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Collaborator {
            context: context.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach a dataset identity to errors raised by the pure model,
    /// which does not know which resource it is validating.
    ///
    /// Errors that already name a dataset are left alone.
    pub fn with_dataset(mut self, identity: impl std::fmt::Display) -> Self {
        match &mut self {
            Error::InvalidSpec { dataset, .. }
            | Error::InconsistentCacheState { dataset, .. }
            | Error::InvalidPhaseTransition { dataset, .. }
            | Error::ImmutableFieldChanged { dataset, .. }
            | Error::StaleWrite { dataset, .. }
            | Error::NotFound { dataset }
            | Error::AlreadyExists { dataset } => {
                if dataset == UNKNOWN_CONTEXT {
                    *dataset = identity.to_string();
                }
            }
            _ => {}
        }
        self
    }

    /// Check if this error is retryable
    ///
    /// `StaleWrite` is retryable by contract: the caller re-reads and tries
    /// again. Validation-class errors need the caller to change its input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::InvalidSpec { .. } => false,
            Error::InvalidQuantity { .. } => false,
            Error::InconsistentCacheState { .. } => false,
            Error::InvalidPhaseTransition { .. } => false,
            Error::ImmutableFieldChanged { .. } => false,
            Error::StaleWrite { .. } => true,
            Error::NotFound { .. } => false,
            Error::AlreadyExists { .. } => false,
            Error::Collaborator { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this is an optimistic-concurrency conflict
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Error::StaleWrite { .. })
    }

    /// Get the dataset identity if this error is associated with one
    pub fn dataset(&self) -> Option<&str> {
        match self {
            Error::InvalidSpec { dataset, .. }
            | Error::InconsistentCacheState { dataset, .. }
            | Error::InvalidPhaseTransition { dataset, .. }
            | Error::ImmutableFieldChanged { dataset, .. }
            | Error::StaleWrite { dataset, .. }
            | Error::NotFound { dataset }
            | Error::AlreadyExists { dataset } => Some(dataset),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Collaborator { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
