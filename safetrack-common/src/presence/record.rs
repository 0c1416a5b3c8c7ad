//! Attendee location record and identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Identifier of a monitored event; scopes all presence data
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// Identifier of an attendee; unique within one event, used as record key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(EventId);
string_id!(UserId);

/// Store path of an event's live location collection
pub fn collection_path(event_id: &EventId) -> String {
    format!("events/{}/live_locations", event_id)
}

/// Attendee severity, self-reported or system-assigned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendeeStatus {
    #[default]
    Safe,
    Attention,
    /// SOS raised
    Emergency,
}

impl fmt::Display for AttendeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttendeeStatus::Safe => "safe",
            AttendeeStatus::Attention => "attention",
            AttendeeStatus::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// One attendee's most recent position within an event
///
/// Serialized as a flat camelCase object with epoch-millisecond timestamps,
/// matching the `events/{eventId}/live_locations/{userId}` layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendeeLocationRecord {
    pub user_id: UserId,
    pub lat: f64,
    pub lng: f64,
    pub status: AttendeeStatus,
    /// Display name, advisory only
    pub name: String,
    /// Horizontal accuracy in metres, when the platform reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// When the position sample was taken (producer clock)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// When the record was last written (producer clock)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

impl AttendeeLocationRecord {
    /// Check required fields before the record enters a store
    pub fn validate(&self) -> Result<()> {
        if self.user_id.as_str().trim().is_empty() {
            return Err(Error::InvalidRecord("userId must not be empty".to_string()));
        }
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::InvalidRecord(format!("lat out of range: {}", self.lat)));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::InvalidRecord(format!("lng out of range: {}", self.lng)));
        }
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(Error::InvalidRecord(format!(
                    "accuracy must be a non-negative number: {}",
                    accuracy
                )));
            }
        }
        Ok(())
    }

    /// Age of the record relative to `now`; negative if written "in the future"
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_seen
    }

    /// Freshness predicate: active iff age is strictly below the threshold
    pub fn is_active(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.age(now) < threshold
    }
}

/// Raw contents of one event's collection, keyed by user
pub type Snapshot = BTreeMap<UserId, AttendeeLocationRecord>;
