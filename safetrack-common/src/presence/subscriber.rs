//! Presence subscriber
//!
//! Turns a raw collection subscription into a stream of [`ActiveView`]s.
//! Every raw snapshot is filtered against the clock at the moment it arrives.
//! Because staleness is a function of time alone, a record can go stale while
//! no writes happen anywhere in the event. The feed therefore also re-filters
//! the last raw snapshot on a local timer and emits whenever the set of
//! active attendees changed.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::{filter_active, ActiveView};
use super::record::{EventId, Snapshot};
use super::store::{CollectionSubscription, SharedStore};
use crate::callback::CallbackGate;
use crate::config::PresenceConfig;
use crate::error::SubscriptionError;
use crate::time::SharedClock;
use crate::Result;

/// Opens filtered views of event collections
#[derive(Clone)]
pub struct PresenceSubscriber {
    store: SharedStore,
    clock: SharedClock,
    stale_threshold: chrono::Duration,
    refilter_interval: Option<Duration>,
}

impl PresenceSubscriber {
    pub fn new(store: SharedStore, clock: SharedClock, config: &PresenceConfig) -> Self {
        Self {
            store,
            clock,
            stale_threshold: config.stale_threshold(),
            refilter_interval: config.refilter_interval(),
        }
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        self.stale_threshold
    }

    /// One-shot filtered read of the current collection
    pub async fn read_active(&self, event_id: &EventId) -> Result<ActiveView> {
        let snapshot = self.store.snapshot(event_id).await?;
        Ok(filter_active(&snapshot, self.clock.now(), self.stale_threshold))
    }

    /// Open a filtered feed on an event collection
    pub async fn subscribe(&self, event_id: &EventId) -> Result<PresenceFeed> {
        let collection = self.store.subscribe_collection(event_id).await?;
        info!(event = %event_id, subscription = %collection.id(), "Presence feed opened");
        Ok(PresenceFeed::new(
            collection,
            self.clock.clone(),
            self.stale_threshold,
            self.refilter_interval,
        ))
    }

    /// Callback form of [`subscribe`](Self::subscribe)
    ///
    /// `on_update` receives the filtered view on every raw snapshot (an empty
    /// view for an empty collection) and whenever the periodic re-filter drops
    /// a stale attendee. Subscription failures, including failure to open,
    /// go to `on_error`; nothing is resubscribed automatically.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe_to_event_locations<U, E>(
        &self,
        event_id: EventId,
        on_update: U,
        on_error: E,
    ) -> Subscription
    where
        U: Fn(ActiveView) + Send + Sync + 'static,
        E: Fn(SubscriptionError) + Send + Sync + 'static,
    {
        let gate = Arc::new(CallbackGate::new());
        let cancel = CancellationToken::new();
        let subscriber = self.clone();

        let task_gate = gate.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut feed = tokio::select! {
                _ = task_cancel.cancelled() => return,
                opened = subscriber.subscribe(&event_id) => match opened {
                    Ok(feed) => feed,
                    Err(e) => {
                        warn!(event = %event_id, "Failed to open presence feed: {}", e);
                        let err = match e {
                            crate::Error::Subscription(err) => err,
                            other => SubscriptionError::Unavailable(other.to_string()),
                        };
                        task_gate.deliver(|| on_error(err));
                        task_gate.close();
                        return;
                    }
                },
            };

            loop {
                let next = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    next = feed.next() => next,
                };
                match next {
                    Some(Ok(view)) => {
                        if !task_gate.deliver(|| on_update(view)) {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(event = %event_id, "Presence feed failed: {}", err);
                        task_gate.deliver(|| on_error(err));
                        break;
                    }
                    None => break,
                }
            }
            feed.close();
            // Nothing more will be delivered; report the handle as inactive
            task_gate.close();
            debug!(event = %event_id, "Presence subscription task finished");
        });

        Subscription { gate, cancel }
    }
}

/// Stream of filtered views for one event
pub struct PresenceFeed {
    collection: CollectionSubscription,
    clock: SharedClock,
    stale_threshold: chrono::Duration,
    refilter: Option<Interval>,
    last_raw: Option<Arc<Snapshot>>,
    last_view: ActiveView,
}

impl PresenceFeed {
    fn new(
        collection: CollectionSubscription,
        clock: SharedClock,
        stale_threshold: chrono::Duration,
        refilter_interval: Option<Duration>,
    ) -> Self {
        let refilter = refilter_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self {
            collection,
            clock,
            stale_threshold,
            refilter,
            last_raw: None,
            last_view: ActiveView::default(),
        }
    }

    pub fn event_id(&self) -> &EventId {
        self.collection.event_id()
    }

    /// Wait for the next filtered view
    ///
    /// Returns `None` after [`close`](Self::close) or after a subscription
    /// error has been reported.
    pub async fn next(&mut self) -> Option<std::result::Result<ActiveView, SubscriptionError>> {
        loop {
            if !self.collection.is_active() {
                return None;
            }

            let refilter_armed = self.last_raw.is_some();
            tokio::select! {
                raw = self.collection.next() => {
                    return match raw? {
                        Ok(snapshot) => {
                            let view = filter_active(&snapshot, self.clock.now(), self.stale_threshold);
                            self.last_raw = Some(snapshot);
                            self.last_view = view.clone();
                            Some(Ok(view))
                        }
                        Err(err) => Some(Err(err)),
                    };
                }
                _ = next_tick(&mut self.refilter), if refilter_armed => {
                    if let Some(view) = self.refilter_last() {
                        return Some(Ok(view));
                    }
                }
            }
        }
    }

    /// Re-filter the last raw snapshot; `Some` only when membership changed
    pub fn refilter_last(&mut self) -> Option<ActiveView> {
        let snapshot = self.last_raw.as_ref()?;
        let view = filter_active(snapshot, self.clock.now(), self.stale_threshold);
        if view.same_members(&self.last_view) {
            return None;
        }
        debug!(
            event = %self.collection.event_id(),
            before = self.last_view.len(),
            after = view.len(),
            "Re-filter changed active set"
        );
        self.last_view = view.clone();
        Some(view)
    }

    /// Last view handed out
    pub fn last_view(&self) -> &ActiveView {
        &self.last_view
    }

    /// Tear down the underlying store subscription; idempotent
    pub fn close(&mut self) {
        self.collection.unsubscribe();
    }
}

async fn next_tick(refilter: &mut Option<Interval>) {
    match refilter {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle to a callback subscription
///
/// Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    gate: Arc<CallbackGate>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Stop delivery and tear down the store subscription
    ///
    /// No callback fires after this returns. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if self.gate.close() {
            debug!("Presence subscription cancelled");
        }
        self.cancel.cancel();
    }

    /// False once unsubscribed or once the feed has ended on its own
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
