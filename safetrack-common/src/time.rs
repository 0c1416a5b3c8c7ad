//! Timestamp utilities
//!
//! Staleness is evaluated against wall-clock time, so every component that
//! stamps or ages a record reads time through a [`Clock`]. Production code
//! uses [`SystemClock`]; tests drive a [`ManualClock`].

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Source of wall-clock time
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle passed between components
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        now()
    }
}

/// Manually advanced clock
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Set the clock to an absolute instant
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = instant;
    }

    /// Move the clock forward by `millis` milliseconds
    pub fn advance_ms(&self, millis: i64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += chrono::Duration::milliseconds(millis);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
