//! Vehicle Property Service Error Types

use thiserror::Error;

/// Failures raised by the platform service itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service hit an internal fault
    #[error("Car service internal error: {0}")]
    Internal(String),

    /// Caller lacks the permission for the property
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Property is not available right now, retry later
    #[error("Property temporarily not available: {0}")]
    TryAgain(String),

    /// Property is not available on this vehicle configuration
    #[error("Property not available: {0}")]
    NotAvailable(String),

    /// Malformed property/area/rate combination
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle is no longer connected to the service
    #[error("Car service disconnected")]
    Disconnected,
}

/// Unified error reported to callers of the property layer
#[derive(Debug, Error)]
pub enum PropertyError {
    /// Service reported an internal fault
    #[error("Internal service error")]
    InternalServiceError(#[source] ServiceError),

    /// Caller lacks required permission for the property
    #[error("Access to property denied")]
    AccessDenied(#[source] ServiceError),

    /// Property not available now but may become so
    #[error("Property temporarily unavailable")]
    TemporarilyUnavailableRetryable(#[source] ServiceError),

    /// Property permanently not available on this vehicle
    #[error("Property unavailable")]
    Unavailable(#[source] ServiceError),

    /// Malformed property/area/rate combination
    #[error("Invalid property request")]
    InvalidArgument(#[source] ServiceError),

    /// Registration explicitly reported failure
    #[error("Subscription unsuccessful for property {property_id:#x} area {area_id:#x}")]
    SubscriptionUnsuccessful { property_id: i32, area_id: i32 },

    /// The handle died underneath the call
    #[error("Service connection lost")]
    ServiceDisconnected(#[source] ServiceError),
}

impl PropertyError {
    /// Whether the caller may reasonably try again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PropertyError::TemporarilyUnavailableRetryable(_)
                | PropertyError::ServiceDisconnected(_)
        )
    }
}

impl From<ServiceError> for PropertyError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Internal(_) => PropertyError::InternalServiceError(err),
            ServiceError::AccessDenied(_) => PropertyError::AccessDenied(err),
            ServiceError::TryAgain(_) => PropertyError::TemporarilyUnavailableRetryable(err),
            ServiceError::NotAvailable(_) => PropertyError::Unavailable(err),
            ServiceError::InvalidArgument(_) => PropertyError::InvalidArgument(err),
            ServiceError::Disconnected => PropertyError::ServiceDisconnected(err),
        }
    }
}
