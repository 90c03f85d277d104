//! Platform Service Capability
//!
//! The vehicle property service is an opaque platform capability. These
//! traits describe its boundary: how a connection is acquired, what a live
//! handle can do, and the callbacks the service invokes. Call shapes differ
//! by platform API level; the constants below are the thresholds.

use crate::error::ServiceError;
use crate::property::{PropertyEvent, RawPropertyValue};
use std::fmt;
use std::sync::Arc;

/// First API level offering the asynchronous connect with readiness callback
pub const ASYNC_CONNECT_MIN_API_LEVEL: u32 = 30;

/// First API level offering explicit subscribe/unsubscribe with a success flag
pub const SUBSCRIBE_EVENTS_MIN_API_LEVEL: u32 = 35;

/// Receives property events from the service
///
/// Implementations are invoked from platform threads and must not block.
pub trait PropertyListener: Send + Sync {
    /// A property value changed
    fn on_change_event(&self, value: RawPropertyValue);

    /// The service reported a malfunction for a property/area
    fn on_error_event(&self, property_id: i32, area_id: i32, error_code: i32);

    /// Dispatch a [`PropertyEvent`] to the matching callback
    fn on_event(&self, event: PropertyEvent) {
        match event {
            PropertyEvent::Changed(value) => self.on_change_event(value),
            PropertyEvent::Error {
                property_id,
                area_id,
                error_code,
            } => self.on_error_event(property_id, area_id, error_code),
        }
    }
}

/// Identity comparison for listener registrations
pub fn same_listener(a: &Arc<dyn PropertyListener>, b: &Arc<dyn PropertyListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Readiness callback of the asynchronous connect
pub trait ReadinessListener: Send + Sync {
    /// `ready == false` means the service was revoked (e.g. it died)
    fn on_lifecycle_changed(&self, handle: ServiceHandle, ready: bool);
}

/// Connection callbacks of the legacy bind
pub trait ConnectionCallback: Send + Sync {
    fn on_service_connected(&self);
    fn on_service_disconnected(&self);
}

/// A live connection to the vehicle property service
pub trait CarHandle: Send + Sync {
    /// Whether the underlying connection is currently up
    fn is_connected(&self) -> bool;

    /// Re-establish the connection of a bound handle (legacy path)
    fn connect(&self) -> Result<(), ServiceError>;

    /// Tear down the connection
    fn disconnect(&self);

    /// Read the current value of a property
    fn read_property(
        &self,
        property_id: i32,
        area_id: i32,
    ) -> Result<Option<RawPropertyValue>, ServiceError>;

    /// Explicit subscribe, reports success as a flag
    fn subscribe_events(
        &self,
        property_id: i32,
        area_id: i32,
        rate_hz: f32,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<bool, ServiceError>;

    /// Remove every subscription of `listener`
    fn unsubscribe_events(&self, listener: &Arc<dyn PropertyListener>) -> Result<(), ServiceError>;

    /// Older callback registration, scoped to a property across all areas
    fn register_callback(
        &self,
        listener: Arc<dyn PropertyListener>,
        property_id: i32,
        rate_hz: f32,
    ) -> Result<(), ServiceError>;

    /// Remove every registration of `listener`
    fn unregister_callback(&self, listener: &Arc<dyn PropertyListener>) -> Result<(), ServiceError>;
}

/// Shared, non-owning reference to a live handle
///
/// Equality is identity: two `ServiceHandle`s are equal when they refer to
/// the same underlying connection object.
#[derive(Clone)]
pub struct ServiceHandle(Arc<dyn CarHandle>);

impl ServiceHandle {
    /// Wrap a platform handle
    pub fn new(handle: Arc<dyn CarHandle>) -> Self {
        Self(handle)
    }

    /// Address used for identity and log output
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl std::ops::Deref for ServiceHandle {
    type Target = dyn CarHandle;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ServiceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ServiceHandle {}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &format_args!("{:#x}", self.id()))
            .field("connected", &self.0.is_connected())
            .finish()
    }
}

/// The platform entry point
pub trait CarPlatform: Send + Sync {
    /// Platform API level, probed once to select call shapes
    fn api_level(&self) -> u32;

    /// Modern path: connect and report readiness through `listener`
    fn connect_async(&self, listener: Arc<dyn ReadinessListener>)
        -> Result<ServiceHandle, ServiceError>;

    /// Legacy path: bind and connect, reporting through `callback`
    fn bind(&self, callback: Arc<dyn ConnectionCallback>) -> Result<ServiceHandle, ServiceError>;
}

/// Whether a platform supports the asynchronous connect
pub fn supports_async_connect(api_level: u32) -> bool {
    api_level >= ASYNC_CONNECT_MIN_API_LEVEL
}

/// Whether a platform supports explicit subscribe/unsubscribe
pub fn supports_subscribe_events(api_level: u32) -> bool {
    api_level >= SUBSCRIBE_EVENTS_MIN_API_LEVEL
}
