//! Geolocation source adapter
//!
//! Boundary to the platform's positioning facility. A source provides a
//! one-shot best-effort fix and a continuous watch that keeps delivering
//! samples until cleared. Each failure is reported once, mapped to a
//! human-readable message; sources never retry on their own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::GeolocationConfig;
use crate::time::SharedClock;

/// Positioning failure modes
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionError {
    #[error("Location permission denied. Allow location access and restart tracking.")]
    PermissionDenied,

    #[error("Location unavailable. Check that GPS or location services are enabled.")]
    PositionUnavailable,

    #[error("Location request timed out. Move to an open area and try again.")]
    Timeout,
}

/// Sampling preferences passed to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    /// Prefer precision over availability
    pub enable_high_accuracy: bool,
    /// Maximum wait for a fix
    pub timeout: Duration,
    /// Oldest cached fix that may be reused
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        GeolocationConfig::default().position_options()
    }
}

/// One position fix
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSample {
    pub lat: f64,
    pub lng: f64,
    /// Horizontal accuracy in metres
    pub accuracy: Option<f64>,
    pub taken_at: DateTime<Utc>,
}

pub type PositionResult = std::result::Result<PositionSample, PositionError>;

/// Platform positioning facility
#[async_trait]
pub trait GeolocationSource: Send + Sync {
    /// Single best-effort fix
    async fn current_position(&self, options: &PositionOptions) -> PositionResult;

    /// Continuous sampling until the returned watch is cleared or dropped
    fn watch_position(&self, options: &PositionOptions) -> PositionWatch;
}

/// Shared handle to a geolocation source
pub type SharedGeolocation = Arc<dyn GeolocationSource>;

/// Cancellable stream of position results
#[derive(Debug)]
pub struct PositionWatch {
    id: u64,
    rx: mpsc::UnboundedReceiver<PositionResult>,
    cancel: CancellationToken,
}

impl PositionWatch {
    pub fn new(id: u64, rx: mpsc::UnboundedReceiver<PositionResult>) -> Self {
        Self {
            id,
            rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next sample or error; `None` once cleared or the source went away
    pub async fn next(&mut self) -> Option<PositionResult> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Stop watching; idempotent
    pub fn clear(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!(watch = self.id, "Clearing position watch");
            self.cancel.cancel();
            self.rx.close();
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Granted,
    Denied,
}

#[derive(Debug)]
struct SimulatedState {
    permission: Permission,
    last_fix: Option<PositionSample>,
    watchers: Vec<mpsc::UnboundedSender<PositionResult>>,
}

#[derive(Debug)]
struct SimulatedInner {
    state: Mutex<SimulatedState>,
    clock: SharedClock,
    next_watch_id: AtomicU64,
}

impl SimulatedInner {
    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (u64, mpsc::UnboundedReceiver<PositionResult>) {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.permission == Permission::Denied {
            let _ = tx.send(Err(PositionError::PermissionDenied));
        } else {
            state.watchers.push(tx);
        }
        (id, rx)
    }

    fn broadcast(&self, result: PositionResult) {
        let mut state = self.lock();
        if let Ok(sample) = &result {
            state.last_fix = Some(sample.clone());
        }
        state.watchers.retain(|tx| tx.send(result.clone()).is_ok());
    }
}

/// Channel-driven geolocation source
///
/// Stands in for a device positioning facility: samples and errors are
/// injected through the paired [`GeolocationFeed`] and fanned out to every
/// open watch and pending one-shot request.
#[derive(Debug, Clone)]
pub struct SimulatedGeolocation {
    inner: Arc<SimulatedInner>,
}

/// Device side of a [`SimulatedGeolocation`]
#[derive(Debug, Clone)]
pub struct GeolocationFeed {
    inner: Arc<SimulatedInner>,
}

impl SimulatedGeolocation {
    pub fn new(clock: SharedClock) -> (Self, GeolocationFeed) {
        let inner = Arc::new(SimulatedInner {
            state: Mutex::new(SimulatedState {
                permission: Permission::Granted,
                last_fix: None,
                watchers: Vec::new(),
            }),
            clock,
            next_watch_id: AtomicU64::new(1),
        });
        (
            Self {
                inner: inner.clone(),
            },
            GeolocationFeed { inner },
        )
    }
}

#[async_trait]
impl GeolocationSource for SimulatedGeolocation {
    async fn current_position(&self, options: &PositionOptions) -> PositionResult {
        {
            let state = self.inner.lock();
            if state.permission == Permission::Denied {
                return Err(PositionError::PermissionDenied);
            }
            if let Some(fix) = &state.last_fix {
                let age = self.inner.clock.now() - fix.taken_at;
                let max_age = chrono::Duration::from_std(options.maximum_age)
                    .unwrap_or(chrono::Duration::zero());
                if age <= max_age {
                    debug!("Reusing cached fix ({} ms old)", age.num_milliseconds());
                    return Ok(fix.clone());
                }
            }
        }

        let (_, mut rx) = self.inner.register();
        match tokio::time::timeout(options.timeout, rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(PositionError::PositionUnavailable),
            Err(_) => Err(PositionError::Timeout),
        }
    }

    fn watch_position(&self, options: &PositionOptions) -> PositionWatch {
        let (id, rx) = self.inner.register();
        debug!(
            watch = id,
            high_accuracy = options.enable_high_accuracy,
            "Started position watch"
        );
        PositionWatch::new(id, rx)
    }
}

impl GeolocationFeed {
    /// Deliver a fix taken now
    pub fn push_sample(&self, lat: f64, lng: f64, accuracy: Option<f64>) {
        let sample = PositionSample {
            lat,
            lng,
            accuracy,
            taken_at: self.inner.clock.now(),
        };
        self.inner.broadcast(Ok(sample));
    }

    /// Report a sampling failure to every open watch
    pub fn push_error(&self, error: PositionError) {
        self.inner.broadcast(Err(error));
    }

    /// Revoke location access; open watches get one `PermissionDenied` and end
    pub fn deny_permission(&self) {
        let mut state = self.inner.lock();
        state.permission = Permission::Denied;
        for tx in state.watchers.drain(..) {
            let _ = tx.send(Err(PositionError::PermissionDenied));
        }
        info!("Simulated location permission denied");
    }

    pub fn grant_permission(&self) {
        self.inner.lock().permission = Permission::Granted;
    }

    /// Watches and one-shot requests still listening
    pub fn active_watches(&self) -> usize {
        self.inner
            .lock()
            .watchers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::Arc;

    fn setup() -> (ManualClock, SimulatedGeolocation, GeolocationFeed) {
        let clock = ManualClock::new(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap());
        let (source, feed) = SimulatedGeolocation::new(Arc::new(clock.clone()));
        (clock, source, feed)
    }

    #[test]
    fn test_error_messages_are_human_readable() {
        assert!(PositionError::PermissionDenied
            .to_string()
            .to_lowercase()
            .contains("permission denied"));
        assert!(PositionError::Timeout.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_watch_receives_samples_in_order() {
        let (_clock, source, feed) = setup();
        let mut watch = source.watch_position(&PositionOptions::default());

        feed.push_sample(12.9, 77.6, Some(5.0));
        feed.push_sample(13.0, 77.7, None);

        assert_eq!(watch.next().await.unwrap().unwrap().lat, 12.9);
        assert_eq!(watch.next().await.unwrap().unwrap().lat, 13.0);
    }

    #[tokio::test]
    async fn test_cleared_watch_yields_nothing() {
        let (_clock, source, feed) = setup();
        let mut watch = source.watch_position(&PositionOptions::default());
        assert_eq!(feed.active_watches(), 1);

        watch.clear();
        watch.clear();
        feed.push_sample(1.0, 1.0, None);

        assert!(watch.next().await.is_none());
        assert_eq!(feed.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_denied_permission_fails_immediately() {
        let (_clock, source, feed) = setup();
        feed.deny_permission();

        let options = PositionOptions::default();
        assert_eq!(
            source.current_position(&options).await,
            Err(PositionError::PermissionDenied)
        );
        let mut watch = source.watch_position(&options);
        assert_eq!(watch.next().await, Some(Err(PositionError::PermissionDenied)));
        assert_eq!(watch.next().await, None);
    }

    #[tokio::test]
    async fn test_current_position_reuses_recent_fix() {
        let (clock, source, feed) = setup();
        let _watch = source.watch_position(&PositionOptions::default());
        feed.push_sample(12.9, 77.6, None);

        clock.advance_ms(5_000);
        let fix = source.current_position(&PositionOptions::default()).await.unwrap();
        assert_eq!(fix.lat, 12.9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_position_times_out() {
        let (_clock, source, _feed) = setup();
        let options = PositionOptions {
            timeout: Duration::from_secs(2),
            ..PositionOptions::default()
        };
        assert_eq!(
            source.current_position(&options).await,
            Err(PositionError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_current_position_waits_for_next_sample() {
        let (_clock, source, feed) = setup();
        let pending = tokio::spawn({
            let source = source.clone();
            async move { source.current_position(&PositionOptions::default()).await }
        });

        // Let the request register before the fix arrives
        while feed.active_watches() == 0 {
            tokio::task::yield_now().await;
        }
        feed.push_sample(48.85, 2.35, Some(20.0));

        let fix = pending.await.unwrap().unwrap();
        assert_eq!(fix.lng, 2.35);
    }
}
