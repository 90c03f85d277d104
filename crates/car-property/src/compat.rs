//! Subscription Compatibility Shim
//!
//! Presents one subscribe/unsubscribe contract over the two call shapes of
//! the platform: explicit `subscribe_events` with a success flag, and the
//! older callback registration that only signals failure by raising.

use car_service::{
    supports_subscribe_events, PropertyError, PropertyIdentity, PropertyListener, ServiceHandle,
};
use std::sync::Arc;
use tracing::debug;

/// Uniform subscription contract over the platform call shapes
pub trait SubscriptionShim: Send + Sync {
    /// Register `listener` for `identity`; `Ok(false)` means the service refused
    fn subscribe(
        &self,
        handle: &ServiceHandle,
        identity: PropertyIdentity,
        rate_hz: f32,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<bool, PropertyError>;

    /// Remove every registration of `listener`
    fn unsubscribe(
        &self,
        handle: &ServiceHandle,
        listener: &Arc<dyn PropertyListener>,
    ) -> Result<(), PropertyError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Explicit subscribe with a success flag
#[derive(Debug, Default)]
pub struct ModernShim;

impl SubscriptionShim for ModernShim {
    fn subscribe(
        &self,
        handle: &ServiceHandle,
        identity: PropertyIdentity,
        rate_hz: f32,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<bool, PropertyError> {
        let subscribed =
            handle.subscribe_events(identity.property_id, identity.area_id, rate_hz, listener)?;
        debug!("subscribe_events({}, {} Hz) -> {}", identity, rate_hz, subscribed);
        Ok(subscribed)
    }

    fn unsubscribe(
        &self,
        handle: &ServiceHandle,
        listener: &Arc<dyn PropertyListener>,
    ) -> Result<(), PropertyError> {
        handle.unsubscribe_events(listener)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "subscribe_events"
    }
}

/// Callback registration; success unless the call raises
#[derive(Debug, Default)]
pub struct LegacyShim;

impl SubscriptionShim for LegacyShim {
    fn subscribe(
        &self,
        handle: &ServiceHandle,
        identity: PropertyIdentity,
        rate_hz: f32,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<bool, PropertyError> {
        // Registration covers every area of the property
        handle.register_callback(listener, identity.property_id, rate_hz)?;
        debug!("register_callback({:#x}, {} Hz)", identity.property_id, rate_hz);
        Ok(true)
    }

    fn unsubscribe(
        &self,
        handle: &ServiceHandle,
        listener: &Arc<dyn PropertyListener>,
    ) -> Result<(), PropertyError> {
        handle.unregister_callback(listener)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "register_callback"
    }
}

/// Pick the shim matching the platform API level
pub fn select_shim(api_level: u32) -> Arc<dyn SubscriptionShim> {
    if supports_subscribe_events(api_level) {
        Arc::new(ModernShim)
    } else {
        Arc::new(LegacyShim)
    }
}
