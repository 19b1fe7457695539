//! Round-trip serialization for every value the system persists.
//!
//! Thin wrapper over serde_json that maps failures into the domain error
//! taxonomy. Timestamps are `chrono::DateTime<Utc>` and travel as RFC 3339
//! strings; malformed input surfaces `FleetError::Serialization`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FleetError;
use crate::ports::Result;

pub fn to_string<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| FleetError::Serialization(e.to_string()))
}

pub fn from_str<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| FleetError::Serialization(e.to_string()))
}
