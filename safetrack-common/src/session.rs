//! Tracking session controller
//!
//! Drives one (event, user) tracking session:
//!
//! ```text
//! Idle ──start──▶ Starting ──first sample──▶ Active ◀──▶ Error (publish failed)
//!                    │                          │
//!                    └──positioning error──▶ Stopped ◀──stop()
//! ```
//!
//! A session issues a one-shot fix and a continuous watch together and
//! publishes on every sample. Publish failures are advisory: the caller's
//! error callback is invoked and sampling continues. A positioning failure
//! before the first sample ends the session, as does a permission denial at
//! any time. Other positioning errors after the first sample are forwarded
//! and the session keeps following the platform.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::CallbackGate;
use crate::config::PresenceConfig;
use crate::geolocation::{PositionError, PositionOptions, PositionResult, PositionSample, SharedGeolocation};
use crate::presence::{AttendeeStatus, EventId, PresencePublisher, UserId};
use crate::Error;

/// Lifecycle state of a tracking session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    /// Waiting for the first position sample
    Starting,
    /// Publishing samples
    Active,
    /// Last publish failed; sampling continues
    Error,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Starts tracking sessions against one store and positioning source
#[derive(Clone)]
pub struct TrackingController {
    publisher: PresencePublisher,
    geolocation: SharedGeolocation,
    options: PositionOptions,
}

impl TrackingController {
    pub fn new(publisher: PresencePublisher, geolocation: SharedGeolocation, config: &PresenceConfig) -> Self {
        Self {
            publisher,
            geolocation,
            options: config.geolocation.position_options(),
        }
    }

    /// Begin publishing the user's position to the event
    ///
    /// Errors are delivered to `on_error`, never returned. The returned handle
    /// stops the session when [`TrackingHandle::stop`] is called or when it is
    /// dropped. Must be called within a tokio runtime.
    pub fn start_location_tracking<E>(
        &self,
        event_id: EventId,
        user_id: UserId,
        name: impl Into<String>,
        on_error: E,
    ) -> TrackingHandle
    where
        E: Fn(Error) + Send + Sync + 'static,
    {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let state_tx = Arc::new(state_tx);
        let (status_tx, status_rx) = watch::channel(AttendeeStatus::Safe);
        let gate = Arc::new(CallbackGate::new());
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        set_state(&state_tx, SessionState::Starting);
        info!(event = %event_id, user = %user_id, "Starting location tracking");

        let driver = SessionDriver {
            publisher: self.publisher.clone(),
            geolocation: self.geolocation.clone(),
            options: self.options,
            event_id: event_id.clone(),
            user_id: user_id.clone(),
            name: name.into(),
            on_error: Arc::new(on_error),
            gate: gate.clone(),
            state: state_tx.clone(),
            status_rx,
            cancel: cancel.clone(),
        };
        let done = finished.clone();
        tokio::spawn(async move {
            driver.run().await;
            done.cancel();
        });

        TrackingHandle {
            event_id,
            user_id,
            state: state_tx,
            status: status_tx,
            gate,
            cancel,
            finished,
        }
    }
}

/// Apply a transition unless the session has already stopped
fn set_state(state: &watch::Sender<SessionState>, next: SessionState) {
    state.send_if_modified(|current| {
        if *current == SessionState::Stopped || *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Handle to a running tracking session
pub struct TrackingHandle {
    event_id: EventId,
    user_id: UserId,
    state: Arc<watch::Sender<SessionState>>,
    status: watch::Sender<AttendeeStatus>,
    gate: Arc<CallbackGate>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl TrackingHandle {
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver observing state transitions
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Change the published status (e.g. raise SOS)
    ///
    /// Re-publishes immediately when a position is already known.
    pub fn set_status(&self, status: AttendeeStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!(event = %self.event_id, user = %self.user_id, %status, "Attendee status changed");
        }
    }

    pub fn status(&self) -> AttendeeStatus {
        *self.status.borrow()
    }

    /// Stop the session
    ///
    /// Cancels the position watch; no error callback fires after this
    /// returns. The session task then removes the published record on a
    /// best-effort basis. Calling `stop` again is a no-op.
    pub fn stop(&self) {
        if !self.gate.close() {
            return;
        }
        self.cancel.cancel();
        set_state(&self.state, SessionState::Stopped);
        info!(event = %self.event_id, user = %self.user_id, "Location tracking stopped");
    }

    /// Wait until the session task has finished its cleanup
    pub async fn stopped(&self) {
        self.finished.cancelled().await;
    }

    /// `stop` followed by `stopped`
    pub async fn stop_and_wait(&self) {
        self.stop();
        self.stopped().await;
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SessionDriver {
    publisher: PresencePublisher,
    geolocation: SharedGeolocation,
    options: PositionOptions,
    event_id: EventId,
    user_id: UserId,
    name: String,
    on_error: ErrorCallback,
    gate: Arc<CallbackGate>,
    state: Arc<watch::Sender<SessionState>>,
    status_rx: watch::Receiver<AttendeeStatus>,
    cancel: CancellationToken,
}

/// What the session loop does after handling one input
enum Flow {
    Continue,
    End,
}

impl SessionDriver {
    async fn run(mut self) {
        let mut watch = self.geolocation.watch_position(&self.options);
        let geolocation = self.geolocation.clone();
        let options = self.options;
        let initial = async move { geolocation.current_position(&options).await };
        tokio::pin!(initial);

        let mut initial_pending = true;
        let mut watch_open = true;
        let mut last_position: Option<PositionSample> = None;
        let mut wrote = false;

        loop {
            let flow = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Flow::End,
                result = &mut initial, if initial_pending => {
                    initial_pending = false;
                    if last_position.is_some() {
                        // The watch already delivered a newer fix
                        Flow::Continue
                    } else {
                        self.on_position(result, &mut last_position, &mut wrote).await
                    }
                }
                item = watch.next(), if watch_open => match item {
                    Some(result) => self.on_position(result, &mut last_position, &mut wrote).await,
                    None => {
                        debug!(event = %self.event_id, user = %self.user_id, "Position watch ended");
                        watch_open = false;
                        if initial_pending || last_position.is_some() {
                            Flow::Continue
                        } else {
                            Flow::End
                        }
                    }
                },
                changed = self.status_rx.changed() => match changed {
                    Ok(()) => match last_position.clone() {
                        Some(position) => self.publish(&position, &mut wrote).await,
                        None => Flow::Continue,
                    },
                    // Handle dropped; cancellation follows
                    Err(_) => Flow::End,
                },
            };

            if matches!(flow, Flow::End) {
                break;
            }
            if !initial_pending && !watch_open {
                debug!(event = %self.event_id, user = %self.user_id, "No positioning source left");
                break;
            }
        }

        watch.clear();
        set_state(&self.state, SessionState::Stopped);
        self.gate.close();

        if wrote {
            self.publisher.remove(&self.event_id, &self.user_id).await;
        }
        debug!(event = %self.event_id, user = %self.user_id, "Tracking session finished");
    }

    async fn on_position(
        &self,
        result: PositionResult,
        last_position: &mut Option<PositionSample>,
        wrote: &mut bool,
    ) -> Flow {
        match result {
            Ok(sample) => {
                if last_position.is_none() {
                    info!(event = %self.event_id, user = %self.user_id, "First position fix acquired");
                }
                *last_position = Some(sample.clone());
                self.publish(&sample, wrote).await
            }
            Err(err) if last_position.is_none() || err == PositionError::PermissionDenied => {
                warn!(
                    event = %self.event_id,
                    user = %self.user_id,
                    "Positioning failed, ending session: {}",
                    err
                );
                self.report(Error::Positioning(err));
                Flow::End
            }
            Err(err) => {
                warn!(event = %self.event_id, user = %self.user_id, "Positioning error: {}", err);
                self.report(Error::Positioning(err));
                Flow::Continue
            }
        }
    }

    async fn publish(&self, sample: &PositionSample, wrote: &mut bool) -> Flow {
        let status = *self.status_rx.borrow();
        *wrote = true;

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Flow::End,
            result = self.publisher.publish(&self.event_id, &self.user_id, sample, status, &self.name) => result,
        };

        match result {
            Ok(_) => set_state(&self.state, SessionState::Active),
            Err(err) => {
                warn!(event = %self.event_id, user = %self.user_id, "Publish failed: {}", err);
                set_state(&self.state, SessionState::Error);
                self.report(err);
            }
        }
        Flow::Continue
    }

    fn report(&self, err: Error) {
        let on_error = &self.on_error;
        self.gate.deliver(|| on_error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geolocation::SimulatedGeolocation;
    use crate::presence::{InMemoryPresenceStore, PresenceStore};
    use crate::time::ManualClock;
    use chrono::DateTime;
    use std::sync::Mutex;

    struct Harness {
        store: Arc<InMemoryPresenceStore>,
        feed: crate::geolocation::GeolocationFeed,
        controller: TrackingController,
        errors: Arc<Mutex<Vec<String>>>,
    }

    fn harness() -> Harness {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        ));
        let store = Arc::new(InMemoryPresenceStore::new());
        let (source, feed) = SimulatedGeolocation::new(clock.clone());
        let publisher = PresencePublisher::new(store.clone(), clock);
        let controller = TrackingController::new(publisher, Arc::new(source), &PresenceConfig::default());
        Harness {
            store,
            feed,
            controller,
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    impl Harness {
        fn start(&self) -> TrackingHandle {
            let errors = self.errors.clone();
            self.controller.start_location_tracking(
                EventId::from("e1"),
                UserId::from("u1"),
                "Asha",
                move |err| errors.lock().unwrap().push(err.to_string()),
            )
        }
    }

    async fn wait_for(handle: &TrackingHandle, wanted: SessionState) {
        let mut rx = handle.state_changes();
        rx.wait_for(|s| *s == wanted).await.unwrap();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Starting.to_string(), "starting");
        assert_eq!(serde_json::to_string(&SessionState::Active).unwrap(), "\"active\"");
    }

    #[tokio::test]
    async fn test_first_sample_activates_and_publishes() {
        let h = harness();
        let handle = h.start();
        assert_eq!(handle.state(), SessionState::Starting);

        while h.feed.active_watches() == 0 {
            tokio::task::yield_now().await;
        }
        h.feed.push_sample(12.9, 77.6, Some(4.0));
        wait_for(&handle, SessionState::Active).await;

        let snapshot = h.store.snapshot(&EventId::from("e1")).await.unwrap();
        assert_eq!(snapshot[&UserId::from("u1")].lat, 12.9);
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_removes_record_and_is_idempotent() {
        let h = harness();
        let handle = h.start();
        while h.feed.active_watches() == 0 {
            tokio::task::yield_now().await;
        }
        h.feed.push_sample(12.9, 77.6, None);
        wait_for(&handle, SessionState::Active).await;

        handle.stop_and_wait().await;
        handle.stop();

        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(h.store.snapshot(&EventId::from("e1")).await.unwrap().is_empty());
        assert_eq!(h.feed.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_set_status_republishes_known_position() {
        let h = harness();
        let handle = h.start();
        while h.feed.active_watches() == 0 {
            tokio::task::yield_now().await;
        }
        h.feed.push_sample(12.9, 77.6, None);
        wait_for(&handle, SessionState::Active).await;

        let mut sub = h.store.subscribe_collection(&EventId::from("e1")).await.unwrap();
        sub.next().await.unwrap().unwrap();

        handle.set_status(AttendeeStatus::Emergency);
        let snapshot = sub.next().await.unwrap().unwrap();
        assert_eq!(snapshot[&UserId::from("u1")].status, AttendeeStatus::Emergency);
        assert_eq!(handle.status(), AttendeeStatus::Emergency);
    }
}
