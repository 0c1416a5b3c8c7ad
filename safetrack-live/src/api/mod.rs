//! HTTP API handlers for safetrack-live

pub mod health;
pub mod locations;
pub mod sse;

pub use health::health_routes;
pub use locations::{delete_live_location, get_live_locations, put_live_location};
pub use sse::live_location_stream;
