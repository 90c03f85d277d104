//! Vehicle Property Streams
//!
//! Exposes vehicle properties (speed, gear, doors, ...) as observable
//! streams and timeout-bound point queries. The connection to the property
//! service is shared, supervised and recovered behind the scenes; callers
//! only see samples.
//!
//! ```rust,no_run
//! use car_property::{PropertyConfig, VehicleProperties};
//! use car_service::{area_id, property_id, MockCarPlatform};
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), car_service::PropertyError> {
//! let properties = VehicleProperties::new(Arc::new(MockCarPlatform::modern()), PropertyConfig::default());
//!
//! let speed = properties
//!     .get_value(property_id::PERF_VEHICLE_SPEED, area_id::GLOBAL, Duration::from_secs(5))
//!     .await?;
//!
//! let mut gear = properties.observe_property(property_id::GEAR_SELECTION, area_id::GLOBAL, 1.0);
//! while let Some(sample) = gear.next().await {
//!     println!("{:?}", sample?);
//! }
//! # Ok(())
//! # }
//! ```

mod compat;
mod config;
mod logging;
mod multiplexer;
mod query;

pub use compat::{select_shim, LegacyShim, ModernShim, SubscriptionShim};
pub use config::{ConfigLoadError, PropertyConfig, ENV_PREFIX};
pub use logging::init_logging;
pub use multiplexer::{PropertyStream, SubscriptionMultiplexer};
pub use query::PointQuery;

pub use car_connection::{ConnectionState, SharedConnection, SupervisorState};
pub use car_service::{Availability, PropertyError, PropertyIdentity, PropertySample, PropertyValue};

use car_service::CarPlatform;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Entry point for observing and reading vehicle properties
pub struct VehicleProperties {
    /// Connection shared by all streams and queries
    connection: SharedConnection,
    multiplexer: SubscriptionMultiplexer,
    query: PointQuery,
    config: PropertyConfig,
}

impl VehicleProperties {
    /// Create a client for the given platform
    ///
    /// Call shapes are selected here, once, from the platform API level. No
    /// connection is made until the first stream or query.
    pub fn new(platform: Arc<dyn CarPlatform>, config: PropertyConfig) -> Self {
        let api_level = platform.api_level();
        let shim = select_shim(api_level);
        info!(
            "Vehicle property client: api level {}, subscriptions via {}",
            api_level,
            shim.name()
        );

        let connection = car_connection::connect_shared(platform, &config.connection);
        Self {
            multiplexer: SubscriptionMultiplexer::new(
                connection.clone(),
                shim,
                config.event_buffer,
            ),
            query: PointQuery::new(connection.clone()),
            connection,
            config,
        }
    }

    /// Observe a property/area; see [`SubscriptionMultiplexer::observe_property`]
    pub fn observe_property(&self, property_id: i32, area_id: i32, rate_hz: f32) -> PropertyStream {
        self.multiplexer
            .observe_property(property_id, area_id, rate_hz)
    }

    /// Observe at the configured default rate
    pub fn observe_property_default_rate(&self, property_id: i32, area_id: i32) -> PropertyStream {
        self.observe_property(property_id, area_id, self.config.default_rate_hz)
    }

    /// Read a single value; `Ok(None)` when nothing arrives within `timeout`
    pub async fn get_value(
        &self,
        property_id: i32,
        area_id: i32,
        timeout: Duration,
    ) -> Result<Option<PropertySample>, PropertyError> {
        self.query.get_value(property_id, area_id, timeout).await
    }

    /// Read a single value with the configured timeout
    pub async fn get_value_with_default_timeout(
        &self,
        property_id: i32,
        area_id: i32,
    ) -> Result<Option<PropertySample>, PropertyError> {
        self.get_value(property_id, area_id, self.config.query_timeout())
            .await
    }

    /// Whether a live service handle currently exists
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.connection_state()
    }

    /// The shared connection backing this client
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    /// Active configuration
    pub fn config(&self) -> &PropertyConfig {
        &self.config
    }
}
