//! Common error types for SafeTrack

use thiserror::Error;

use crate::geolocation::PositionError;

/// Common result type for SafeTrack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a collection subscription can fail
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The store refused to open the subscription
    #[error("Subscription unavailable: {0}")]
    Unavailable(String),

    /// The store tore down an established subscription
    #[error("Subscription dropped by the presence store")]
    Dropped,
}

/// Common error types across SafeTrack components
///
/// Errors raised inside spawned session or subscription tasks never cross the
/// async boundary as panics; they are handed to the caller's error callback.
#[derive(Error, Debug)]
pub enum Error {
    /// Platform positioning failure (permission, availability, timeout)
    #[error(transparent)]
    Positioning(#[from] PositionError),

    /// Store upsert or delete failed (network, auth, quota, shutdown)
    #[error("Write failure: {0}")]
    WriteFailure(String),

    /// Store read subscription failed to open or was dropped
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// Record rejected at the store boundary
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error ends a tracking session rather than being advisory
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Positioning(PositionError::PermissionDenied))
    }
}
