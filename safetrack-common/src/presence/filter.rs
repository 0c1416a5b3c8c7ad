//! Staleness filter
//!
//! The store never expires records. Whether an attendee is "present" is
//! decided at read time: a record is active iff `now - lastSeen` is strictly
//! below the stale threshold. Missing and stale records are indistinguishable
//! to consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::record::{AttendeeLocationRecord, AttendeeStatus, Snapshot, UserId};

/// Filtered mapping of currently active attendees
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ActiveView(BTreeMap<UserId, AttendeeLocationRecord>);

impl ActiveView {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.0.contains_key(user_id)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&AttendeeLocationRecord> {
        self.0.get(user_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &AttendeeLocationRecord> {
        self.0.values()
    }

    /// Active attendees currently signalling SOS
    pub fn emergencies(&self) -> impl Iterator<Item = &AttendeeLocationRecord> {
        self.records()
            .filter(|r| r.status == AttendeeStatus::Emergency)
    }

    /// True when both views hold the same attendees (records may differ)
    pub fn same_members(&self, other: &ActiveView) -> bool {
        self.0.len() == other.0.len() && self.0.keys().eq(other.0.keys())
    }

    pub fn into_inner(self) -> BTreeMap<UserId, AttendeeLocationRecord> {
        self.0
    }
}

/// Keep only records with `now - last_seen < threshold`
pub fn filter_active(snapshot: &Snapshot, now: DateTime<Utc>, threshold: chrono::Duration) -> ActiveView {
    ActiveView(
        snapshot
            .iter()
            .filter(|(_, record)| record.is_active(now, threshold))
            .map(|(user_id, record)| (user_id.clone(), record.clone()))
            .collect(),
    )
}
