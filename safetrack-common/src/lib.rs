//! # SafeTrack Common Library
//!
//! Live-location presence core shared by SafeTrack services:
//! - Attendee location records and the presence store contract
//! - Presence publisher and staleness-filtered subscriber
//! - Geolocation source adapter boundary
//! - Tracking session controller
//! - Configuration loading and clock utilities

mod callback;

pub mod config;
pub mod error;
pub mod geolocation;
pub mod presence;
pub mod session;
pub mod time;

pub use config::PresenceConfig;
pub use error::{Error, Result, SubscriptionError};
