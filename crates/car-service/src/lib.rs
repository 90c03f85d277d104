//! Vehicle Property Service Boundary
//!
//! This crate describes the onboard vehicle property service as seen from
//! the client side: property identities and samples, the platform
//! capability traits with their version-dependent call shapes, and the
//! unified error taxonomy. A scriptable mock platform is included.

mod error;
pub mod mock;
mod platform;
mod property;

pub use error::{PropertyError, ServiceError};
pub use mock::{MockCarPlatform, MockSettings};
pub use platform::{
    same_listener, supports_async_connect, supports_subscribe_events, CarHandle, CarPlatform,
    ConnectionCallback, PropertyListener, ReadinessListener, ServiceHandle,
    ASYNC_CONNECT_MIN_API_LEVEL, SUBSCRIBE_EVENTS_MIN_API_LEVEL,
};
pub use property::{
    Availability, PropertyEvent, PropertyIdentity, PropertySample, PropertyStatus, PropertyValue,
    RawPropertyValue,
};

/// Well-known vehicle property identifiers
pub mod property_id {
    /// Vehicle speed (m/s, float)
    pub const PERF_VEHICLE_SPEED: i32 = 0x1160_0207;
    /// Speed shown on the instrument cluster (m/s, float)
    pub const PERF_VEHICLE_SPEED_DISPLAY: i32 = 0x1160_0208;
    /// Gear selected by the driver (int)
    pub const GEAR_SELECTION: i32 = 0x1140_0400;
    /// Gear the transmission is in (int)
    pub const CURRENT_GEAR: i32 = 0x1140_0401;
    /// Fuel level (ml, float)
    pub const FUEL_LEVEL: i32 = 0x1160_0307;
    /// Ignition state (int)
    pub const IGNITION_STATE: i32 = 0x1140_0409;
    /// Parking brake engaged (bool)
    pub const PARKING_BRAKE_ON: i32 = 0x1120_0402;
    /// Door lock, per door area (bool)
    pub const DOOR_LOCK: i32 = 0x1620_0B02;
    /// Engine RPM (float)
    pub const ENGINE_RPM: i32 = 0x1160_0305;
}

/// Well-known area identifiers
pub mod area_id {
    /// Property applies to the whole vehicle
    pub const GLOBAL: i32 = 0;
    /// First row, left seat (driver in left-hand drive vehicles)
    pub const ROW_1_LEFT: i32 = 0x0001;
    /// First row, right seat
    pub const ROW_1_RIGHT: i32 = 0x0004;
    /// Second row, left seat
    pub const ROW_2_LEFT: i32 = 0x0010;
    /// Second row, right seat
    pub const ROW_2_RIGHT: i32 = 0x0040;
    /// Driver seat of a left-hand drive vehicle
    pub const DRIVER: i32 = ROW_1_LEFT;
}
