//! Presence publisher
//!
//! Writes the current user's record into an event collection. Each write
//! stamps `timestamp` and `lastSeen` with the publisher's clock, so every
//! publish doubles as a liveness heartbeat.

use tracing::{debug, warn};

use super::record::{AttendeeLocationRecord, AttendeeStatus, EventId, UserId};
use super::store::SharedStore;
use crate::geolocation::PositionSample;
use crate::time::SharedClock;
use crate::{Error, Result};

#[derive(Clone)]
pub struct PresencePublisher {
    store: SharedStore,
    clock: SharedClock,
}

impl PresencePublisher {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Overwrite the user's record with the given position
    ///
    /// Returns the record as written. Failures come back as
    /// `Error::WriteFailure` (or `InvalidRecord`) and are not retried.
    pub async fn publish(
        &self,
        event_id: &EventId,
        user_id: &UserId,
        position: &PositionSample,
        status: AttendeeStatus,
        name: &str,
    ) -> Result<AttendeeLocationRecord> {
        let now = self.clock.now();
        let record = AttendeeLocationRecord {
            user_id: user_id.clone(),
            lat: position.lat,
            lng: position.lng,
            status,
            name: name.to_string(),
            accuracy: position.accuracy,
            timestamp: now,
            last_seen: now,
        };

        match self.store.upsert(event_id, record.clone()).await {
            Ok(()) => {
                debug!(event = %event_id, user = %user_id, %status, "Published location");
                Ok(record)
            }
            Err(e @ Error::InvalidRecord(_)) => Err(e),
            Err(Error::WriteFailure(msg)) => Err(Error::WriteFailure(msg)),
            Err(other) => Err(Error::WriteFailure(other.to_string())),
        }
    }

    /// Best-effort removal of the user's record; failures are only logged
    pub async fn remove(&self, event_id: &EventId, user_id: &UserId) {
        match self.store.delete(event_id, user_id).await {
            Ok(()) => debug!(event = %event_id, user = %user_id, "Removed live location"),
            Err(e) => warn!(
                event = %event_id,
                user = %user_id,
                "Failed to remove live location (ignored): {}",
                e
            ),
        }
    }
}
