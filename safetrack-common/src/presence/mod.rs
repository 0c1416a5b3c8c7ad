//! Live presence for events
//!
//! Attendees publish their position into a per-event collection; observers
//! subscribe to a filtered view containing only attendees whose record was
//! written within the stale threshold.
//!
//! ```text
//! PresencePublisher ──upsert/delete──▶ PresenceStore ──snapshots──▶ PresenceSubscriber
//!                                                                   (staleness filter)
//! ```

pub mod filter;
pub mod publisher;
pub mod record;
pub mod store;
pub mod subscriber;

pub use filter::{filter_active, ActiveView};
pub use publisher::PresencePublisher;
pub use record::{collection_path, AttendeeLocationRecord, AttendeeStatus, EventId, Snapshot, UserId};
pub use store::{CollectionSubscription, InMemoryPresenceStore, PresenceStore, SharedStore};
pub use subscriber::{PresenceFeed, PresenceSubscriber, Subscription};
