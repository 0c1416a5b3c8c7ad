//! Presence store contract and in-memory implementation
//!
//! A presence store is a per-event, real-time synchronized map from user to
//! [`AttendeeLocationRecord`]. Each key has a single writer (the owning
//! tracking session) and any number of readers.
//!
//! Subscriptions observe the whole collection. Every change to any key
//! produces a fresh full snapshot; rapid successive changes may be coalesced
//! into one delivery, but the latest state is never lost.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::record::{collection_path, AttendeeLocationRecord, EventId, Snapshot, UserId};
use crate::error::SubscriptionError;
use crate::{Error, Result};

/// Shared handle to a presence store
pub type SharedStore = Arc<dyn PresenceStore>;

type Collections = HashMap<EventId, watch::Sender<Arc<Snapshot>>>;

fn lock_collections(collections: &Mutex<Collections>) -> MutexGuard<'_, Collections> {
    collections.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the collection when it holds no records and has no readers
fn prune_if_idle(collections: &mut Collections, event_id: &EventId) -> bool {
    let idle = collections
        .get(event_id)
        .is_some_and(|tx| tx.borrow().is_empty() && tx.receiver_count() == 0);
    if idle {
        collections.remove(event_id);
    }
    idle
}

/// Backend holding live location collections
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Create or overwrite the record keyed by `record.user_id` (last write wins)
    async fn upsert(&self, event_id: &EventId, record: AttendeeLocationRecord) -> Result<()>;

    /// Remove a user's record; removing an absent key succeeds
    async fn delete(&self, event_id: &EventId, user_id: &UserId) -> Result<()>;

    /// Fresh read of the raw collection
    async fn snapshot(&self, event_id: &EventId) -> Result<Snapshot>;

    /// Observe the whole collection
    ///
    /// The returned subscription yields the current snapshot first, then a new
    /// snapshot after every change.
    async fn subscribe_collection(
        &self,
        event_id: &EventId,
    ) -> std::result::Result<CollectionSubscription, SubscriptionError>;
}

/// Live view of one event collection
///
/// Backed by a `watch` channel: a store implementation (local or remote)
/// keeps the sender side current, and the receiver always observes the most
/// recent snapshot.
#[derive(Debug)]
pub struct CollectionSubscription {
    id: Uuid,
    event_id: EventId,
    rx: Option<watch::Receiver<Arc<Snapshot>>>,
    owner: Option<Weak<Mutex<Collections>>>,
}

impl CollectionSubscription {
    /// Wrap a receiver; the current value is delivered on the first `next()`
    pub fn new(event_id: EventId, mut rx: watch::Receiver<Arc<Snapshot>>) -> Self {
        rx.mark_changed();
        Self {
            id: Uuid::new_v4(),
            event_id,
            rx: Some(rx),
            owner: None,
        }
    }

    /// Prune the owning in-memory collection when this subscription ends
    fn owned_by(mut self, collections: &Arc<Mutex<Collections>>) -> Self {
        self.owner = Some(Arc::downgrade(collections));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Wait for the next raw snapshot
    ///
    /// Returns `None` once unsubscribed. If the store drops the channel the
    /// subscription yields `Dropped` exactly once and then ends.
    pub async fn next(&mut self) -> Option<std::result::Result<Arc<Snapshot>, SubscriptionError>> {
        let rx = self.rx.as_mut()?;
        match rx.changed().await {
            Ok(()) => Some(Ok(rx.borrow_and_update().clone())),
            Err(_) => {
                debug!(subscription = %self.id, "Collection channel closed by store");
                self.rx = None;
                Some(Err(SubscriptionError::Dropped))
            }
        }
    }

    /// Tear down the subscription; safe to call repeatedly
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            debug!(subscription = %self.id, event = %self.event_id, "Unsubscribed from collection");
        }
        self.release();
    }

    /// Receiver must already be dropped so the count below excludes it
    fn release(&mut self) {
        let Some(collections) = self.owner.take().and_then(|owner| owner.upgrade()) else {
            return;
        };
        if prune_if_idle(&mut lock_collections(&collections), &self.event_id) {
            debug!(path = %collection_path(&self.event_id), "Pruned idle collection");
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

impl Drop for CollectionSubscription {
    fn drop(&mut self) {
        self.rx = None;
        self.release();
    }
}

/// Process-local presence store
///
/// Each event collection is a `watch` channel holding an immutable snapshot;
/// writers replace the snapshot and every subscriber is woken.
#[derive(Debug, Default)]
pub struct InMemoryPresenceStore {
    collections: Arc<Mutex<Collections>>,
    closed: AtomicBool,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every collection
    ///
    /// Established subscriptions observe `SubscriptionError::Dropped`; later
    /// writes fail with `WriteFailure` and later subscriptions are refused.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut collections = self.lock();
            let count = collections.len();
            collections.clear();
            count
        };
        info!("Presence store shut down ({} collections closed)", dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of event collections currently held
    pub fn collection_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of open subscriptions on an event collection
    pub fn subscriber_count(&self, event_id: &EventId) -> usize {
        self.lock()
            .get(event_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        lock_collections(&self.collections)
    }

    fn ensure_open_for_write(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::WriteFailure("presence store is shut down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn upsert(&self, event_id: &EventId, record: AttendeeLocationRecord) -> Result<()> {
        record.validate()?;
        self.ensure_open_for_write()?;

        let mut collections = self.lock();
        let tx = collections
            .entry(event_id.clone())
            .or_insert_with(|| watch::channel(Arc::new(Snapshot::new())).0);

        debug!(
            path = %collection_path(event_id),
            user = %record.user_id,
            "Upsert live location"
        );
        tx.send_modify(|snapshot| {
            Arc::make_mut(snapshot).insert(record.user_id.clone(), record);
        });
        Ok(())
    }

    async fn delete(&self, event_id: &EventId, user_id: &UserId) -> Result<()> {
        self.ensure_open_for_write()?;

        let mut collections = self.lock();
        let Some(tx) = collections.get(event_id) else {
            return Ok(());
        };

        let removed = tx.send_if_modified(|snapshot| {
            if snapshot.contains_key(user_id) {
                Arc::make_mut(snapshot).remove(user_id);
                true
            } else {
                false
            }
        });
        if removed {
            debug!(path = %collection_path(event_id), user = %user_id, "Deleted live location");
        }

        prune_if_idle(&mut collections, event_id);
        Ok(())
    }

    async fn snapshot(&self, event_id: &EventId) -> Result<Snapshot> {
        if self.is_closed() {
            return Err(SubscriptionError::Unavailable("presence store is shut down".to_string()).into());
        }
        Ok(self
            .lock()
            .get(event_id)
            .map(|tx| Snapshot::clone(&tx.borrow()))
            .unwrap_or_default())
    }

    async fn subscribe_collection(
        &self,
        event_id: &EventId,
    ) -> std::result::Result<CollectionSubscription, SubscriptionError> {
        if self.is_closed() {
            return Err(SubscriptionError::Unavailable(
                "presence store is shut down".to_string(),
            ));
        }

        let rx = self
            .lock()
            .entry(event_id.clone())
            .or_insert_with(|| watch::channel(Arc::new(Snapshot::new())).0)
            .subscribe();

        let subscription = CollectionSubscription::new(event_id.clone(), rx).owned_by(&self.collections);
        debug!(
            subscription = %subscription.id(),
            path = %collection_path(event_id),
            "Opened collection subscription"
        );
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::record::AttendeeStatus;
    use chrono::{DateTime, Utc};

    fn record(user: &str, lat: f64) -> AttendeeLocationRecord {
        let at: DateTime<Utc> = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        AttendeeLocationRecord {
            user_id: UserId::from(user),
            lat,
            lng: 77.6,
            status: AttendeeStatus::Safe,
            name: user.to_string(),
            accuracy: None,
            timestamp: at,
            last_seen: at,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_last_write_wins() {
        let store = InMemoryPresenceStore::new();
        let event = EventId::from("e1");

        for lat in [10.0, 11.0, 12.5] {
            store.upsert(&event, record("u1", lat)).await.unwrap();
        }

        let snapshot = store.snapshot(&event).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&UserId::from("u1")].lat, 12.5);
    }

    #[tokio::test]
    async fn test_events_are_isolated() {
        let store = InMemoryPresenceStore::new();
        store.upsert(&EventId::from("e1"), record("u1", 1.0)).await.unwrap();

        let other = store.snapshot(&EventId::from("e2")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_record_rejected() {
        let store = InMemoryPresenceStore::new();
        let result = store.upsert(&EventId::from("e1"), record("u1", 123.0)).await;
        assert!(matches!(result, Err(Error::InvalidRecord(_))));
    }

    #[tokio::test]
    async fn test_subscription_receives_initial_then_changes() {
        let store = InMemoryPresenceStore::new();
        let event = EventId::from("e1");
        store.upsert(&event, record("u1", 1.0)).await.unwrap();

        let mut sub = store.subscribe_collection(&event).await.unwrap();
        let initial = sub.next().await.unwrap().unwrap();
        assert_eq!(initial.len(), 1);

        store.upsert(&event, record("u2", 2.0)).await.unwrap();
        let next = sub.next().await.unwrap().unwrap();
        assert_eq!(next.len(), 2);

        store.delete(&event, &UserId::from("u1")).await.unwrap();
        let after_delete = sub.next().await.unwrap().unwrap();
        assert!(!after_delete.contains_key(&UserId::from("u1")));
    }

    #[tokio::test]
    async fn test_subscription_on_empty_collection_yields_empty_snapshot() {
        let store = InMemoryPresenceStore::new();
        let mut sub = store.subscribe_collection(&EventId::from("empty")).await.unwrap();
        assert!(sub.next().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rapid_writes_coalesce_to_latest() {
        let store = InMemoryPresenceStore::new();
        let event = EventId::from("e1");
        let mut sub = store.subscribe_collection(&event).await.unwrap();
        sub.next().await.unwrap().unwrap();

        for lat in [1.0, 2.0, 3.0] {
            store.upsert(&event, record("u1", lat)).await.unwrap();
        }

        let latest = sub.next().await.unwrap().unwrap();
        assert_eq!(latest[&UserId::from("u1")].lat, 3.0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let store = InMemoryPresenceStore::new();
        let event = EventId::from("e1");
        let mut sub = store.subscribe_collection(&event).await.unwrap();
        assert_eq!(store.subscriber_count(&event), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(sub.next().await.is_none());
        assert_eq!(store.subscriber_count(&event), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drops_subscriptions_and_fails_writes() {
        let store = InMemoryPresenceStore::new();
        let event = EventId::from("e1");
        let mut sub = store.subscribe_collection(&event).await.unwrap();
        sub.next().await.unwrap().unwrap();

        store.shutdown();

        assert_eq!(sub.next().await, Some(Err(SubscriptionError::Dropped)));
        assert!(sub.next().await.is_none());
        assert!(matches!(
            store.upsert(&event, record("u1", 1.0)).await,
            Err(Error::WriteFailure(_))
        ));
        assert!(store.subscribe_collection(&event).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_only_collections_are_pruned() {
        let store = InMemoryPresenceStore::new();

        for i in 0..1000 {
            let mut sub = store.subscribe_collection(&EventId::new(format!("e{}", i))).await.unwrap();
            if i % 2 == 0 {
                sub.unsubscribe();
            }
            // odd ids are released on drop
        }

        assert_eq!(store.collection_count(), 0);
    }

    #[tokio::test]
    async fn test_collection_with_records_survives_unsubscribe() {
        let store = InMemoryPresenceStore::new();
        let event = EventId::from("e1");
        store.upsert(&event, record("u1", 1.0)).await.unwrap();

        let mut first = store.subscribe_collection(&event).await.unwrap();
        let second = store.subscribe_collection(&event).await.unwrap();
        first.unsubscribe();
        assert_eq!(store.collection_count(), 1);
        assert_eq!(store.subscriber_count(&event), 1);

        drop(second);
        store.delete(&event, &UserId::from("u1")).await.unwrap();
        assert_eq!(store.collection_count(), 0);
    }

    #[tokio::test]
    async fn test_pruned_collection_can_be_reopened() {
        let store = InMemoryPresenceStore::new();
        let event = EventId::from("e1");
        drop(store.subscribe_collection(&event).await.unwrap());

        let mut sub = store.subscribe_collection(&event).await.unwrap();
        store.upsert(&event, record("u1", 2.0)).await.unwrap();
        let snapshot = sub.next().await.unwrap().unwrap();
        assert_eq!(snapshot[&UserId::from("u1")].lat, 2.0);
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_ok() {
        let store = InMemoryPresenceStore::new();
        let result = store.delete(&EventId::from("e1"), &UserId::from("ghost")).await;
        assert!(result.is_ok());
    }
}
