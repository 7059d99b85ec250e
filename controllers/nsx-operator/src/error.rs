//! Controller-specific error types.
//!
//! This module defines error types specific to the NSX Operator
//! that are not covered by upstream library errors.

use crate::allocator::AllocatorError;
use crate::realization::RealizationError;
use kube::Error as KubeError;
use nsx_client::NsxError;
use thiserror::Error;

/// Errors that can occur in the NSX Operator.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// NSX Policy API error
    #[error("NSX error: {0}")]
    Nsx(#[from] NsxError),

    /// IP allocation failed
    #[error("IP allocation failed: {0}")]
    Allocation(#[from] AllocatorError),

    /// Backend object did not reach the realized state
    #[error("Realization failed: {0}")]
    Realization(#[from] RealizationError),

    /// Resource is missing required fields or carries an invalid spec
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// More than one Network is annotated as the default
    #[error("Multiple default networks found: {0}")]
    MultipleDefaultNetworks(String),

    /// Reconciliation was cancelled before it finished
    #[error("Reconciliation cancelled")]
    Cancelled,

    /// Reconciliation ran past its deadline
    #[error("Reconciliation timed out after {0}s")]
    Timeout(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Some keys could not be requeued after a network-mode change
    #[error("Requeue after network mode change failed: {0}")]
    Requeue(String),

    /// Garbage collection finished with failures
    #[error("Garbage collection failed: {0}")]
    GarbageCollection(String),

    /// HTTP server (metrics or webhook) failed
    #[error("Server error: {0}")]
    Server(String),
}

/// Retry class used to pick a requeue backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryClass {
    /// Backend or API hiccup, retry soon
    Transient,
    /// Needs a user to change something, retry slowly
    UserActionable,
}

impl ControllerError {
    /// CamelCase reason written to the Ready condition and to events
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Kube(_) => "KubernetesError",
            ControllerError::Nsx(_) => "NsxError",
            ControllerError::Allocation(AllocatorError::PoolExhausted { .. }) => "PoolExhausted",
            ControllerError::Allocation(AllocatorError::Conflict(_)) => "AllocationConflict",
            ControllerError::Allocation(_) => "AllocationFailed",
            ControllerError::Realization(RealizationError::Timeout { .. }) => "RealizationTimeout",
            ControllerError::Realization(_) => "RealizationFailed",
            ControllerError::InvalidResource(_) => "InvalidSpec",
            ControllerError::MultipleDefaultNetworks(_) => "MultipleDefaultNetworks",
            ControllerError::Cancelled => "Cancelled",
            ControllerError::Timeout(_) => "Timeout",
            ControllerError::InvalidConfig(_) => "InvalidConfig",
            ControllerError::Watch(_) => "WatchFailed",
            ControllerError::Requeue(_) => "RequeueFailed",
            ControllerError::GarbageCollection(_) => "GarbageCollectionFailed",
            ControllerError::Server(_) => "ServerError",
        }
    }

    /// True when retrying without a user change cannot succeed
    pub fn is_user_actionable(&self) -> bool {
        match self {
            ControllerError::Allocation(AllocatorError::Conflict(_))
            | ControllerError::Allocation(AllocatorError::InvalidRequest(_))
            | ControllerError::Allocation(AllocatorError::UnknownPool(_))
            | ControllerError::Allocation(AllocatorError::PoolExhausted { .. })
            | ControllerError::InvalidResource(_)
            | ControllerError::MultipleDefaultNetworks(_) => true,
            ControllerError::Realization(RealizationError::Failed { .. }) => true,
            ControllerError::Nsx(e) => !e.is_transient() && !matches!(e, NsxError::Authentication(_)),
            _ => false,
        }
    }

    /// Backoff class for requeueing after this error
    pub fn retry_class(&self) -> RetryClass {
        if self.is_user_actionable() {
            RetryClass::UserActionable
        } else {
            RetryClass::Transient
        }
    }
}
