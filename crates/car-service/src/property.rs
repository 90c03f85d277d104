//! Property Identity, Values and Samples
//!
//! Defines what a property is, the payloads the service delivers for it and
//! the sample type handed to callers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a single observable value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyIdentity {
    /// Property identifier (e.g. vehicle speed)
    pub property_id: i32,
    /// Area the property is scoped to (e.g. global, driver seat)
    pub area_id: i32,
}

impl PropertyIdentity {
    /// Create a new property identity
    pub fn new(property_id: i32, area_id: i32) -> Self {
        Self {
            property_id,
            area_id,
        }
    }

    /// Exact match on both property and area
    pub fn matches(&self, property_id: i32, area_id: i32) -> bool {
        self.property_id == property_id && self.area_id == area_id
    }
}

impl fmt::Display for PropertyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}@{:#x}", self.property_id, self.area_id)
    }
}

/// Typed property payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Int32Vec(Vec<i32>),
    FloatVec(Vec<f32>),
    String(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Numeric view of scalar values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropertyValue::Int32(v) => Some(*v as f64),
            PropertyValue::Int64(v) => Some(*v as f64),
            PropertyValue::Float(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Per-sample status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Availability {
    /// Value is usable
    Available,
    /// Value is known to be unavailable
    Unavailable,
    /// The service reported an error for this property
    Error,
}

/// Status the service attaches to a raw value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyStatus {
    Available,
    Unavailable,
    Error,
}

impl From<PropertyStatus> for Availability {
    fn from(status: PropertyStatus) -> Self {
        match status {
            PropertyStatus::Available => Availability::Available,
            PropertyStatus::Unavailable => Availability::Unavailable,
            PropertyStatus::Error => Availability::Error,
        }
    }
}

/// A value as delivered by the service, not yet filtered or converted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPropertyValue {
    pub property_id: i32,
    pub area_id: i32,
    pub status: PropertyStatus,
    /// Elapsed realtime of the measurement (ns)
    pub timestamp_nanos: i64,
    pub value: PropertyValue,
}

impl RawPropertyValue {
    /// Create an available raw value
    pub fn new(identity: PropertyIdentity, value: PropertyValue, timestamp_nanos: i64) -> Self {
        Self {
            property_id: identity.property_id,
            area_id: identity.area_id,
            status: PropertyStatus::Available,
            timestamp_nanos,
            value,
        }
    }

    /// Identity this value belongs to
    pub fn identity(&self) -> PropertyIdentity {
        PropertyIdentity::new(self.property_id, self.area_id)
    }
}

/// Events a listener receives from the service
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyEvent {
    /// The value changed (or was re-sent at the subscribed rate)
    Changed(RawPropertyValue),
    /// The service reported a malfunction for a property/area
    Error {
        property_id: i32,
        area_id: i32,
        error_code: i32,
    },
}

/// A sample emitted to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySample {
    /// Which property this sample describes
    pub identity: PropertyIdentity,
    /// Payload, absent for error samples
    pub value: Option<PropertyValue>,
    /// Timestamp reported by the service (ns)
    pub timestamp_nanos: i64,
    /// Whether the value is usable
    pub availability: Availability,
}

impl PropertySample {
    /// Convert a raw service value into a sample
    pub fn from_raw(raw: RawPropertyValue) -> Self {
        Self {
            identity: raw.identity(),
            availability: raw.status.into(),
            timestamp_nanos: raw.timestamp_nanos,
            value: Some(raw.value),
        }
    }

    /// Sample marking an identity as errored
    pub fn error(identity: PropertyIdentity) -> Self {
        Self {
            identity,
            value: None,
            timestamp_nanos: 0,
            availability: Availability::Error,
        }
    }

    /// Check if the sample carries a usable value
    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available && self.value.is_some()
    }
}
