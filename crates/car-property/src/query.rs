//! Point Query
//!
//! One-shot, timeout-bound reads of a single property value.

use car_connection::{ConnectionSubscriber, SharedConnection};
use car_service::{
    PropertyError, PropertyIdentity, PropertySample, RawPropertyValue, ServiceError, ServiceHandle,
};
use std::time::Duration;
use tracing::{debug, warn};

/// Read a property on the blocking pool; platform reads may block on IPC
pub(crate) async fn read_blocking(
    handle: &ServiceHandle,
    identity: PropertyIdentity,
) -> Result<Option<RawPropertyValue>, ServiceError> {
    let handle = handle.clone();
    tokio::task::spawn_blocking(move || handle.read_property(identity.property_id, identity.area_id))
        .await
        .unwrap_or_else(|e| {
            warn!("Read task for {} failed: {}", identity, e);
            Err(ServiceError::Internal(e.to_string()))
        })
}

/// Timeout-bound single value reads
pub struct PointQuery {
    connection: SharedConnection,
}

impl PointQuery {
    /// Create a point query over the shared connection
    pub fn new(connection: SharedConnection) -> Self {
        Self { connection }
    }

    /// Read the current value of a property
    ///
    /// Waits up to `timeout` for a ready connection and the read itself.
    /// Running out of time yields `Ok(None)`; service failures are errors.
    pub async fn get_value(
        &self,
        property_id: i32,
        area_id: i32,
        timeout: Duration,
    ) -> Result<Option<PropertySample>, PropertyError> {
        let identity = PropertyIdentity::new(property_id, area_id);
        let mut subscriber = self.connection.subscribe();

        match tokio::time::timeout(timeout, read_when_ready(&mut subscriber, identity)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("No value for {} within {:?}", identity, timeout);
                Ok(None)
            }
        }
    }
}

async fn read_when_ready(
    subscriber: &mut ConnectionSubscriber,
    identity: PropertyIdentity,
) -> Result<Option<PropertySample>, PropertyError> {
    loop {
        let Some(handle) = subscriber.wait_for_handle().await else {
            return Ok(None);
        };
        match read_blocking(&handle, identity).await {
            Ok(raw) => return Ok(raw.map(PropertySample::from_raw)),
            Err(ServiceError::Disconnected) => {
                debug!("Connection lost while reading {}, waiting for the next handle", identity);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
