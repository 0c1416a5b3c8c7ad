//! safetrack-live library - HTTP facade over the presence store
//!
//! Hosts one process-local presence store and exposes it as REST endpoints
//! plus an SSE stream of the staleness-filtered view per event.

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use safetrack_common::presence::{InMemoryPresenceStore, PresenceSubscriber};
use safetrack_common::time::SharedClock;
use safetrack_common::PresenceConfig;

pub mod api;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Backing presence store
    pub store: Arc<InMemoryPresenceStore>,
    /// Filtered readers over `store`
    pub subscriber: PresenceSubscriber,
    pub config: Arc<PresenceConfig>,
}

impl AppState {
    /// Create new application state
    pub fn new(store: Arc<InMemoryPresenceStore>, clock: SharedClock, config: PresenceConfig) -> Self {
        let subscriber = PresenceSubscriber::new(store.clone(), clock, &config);
        Self {
            store,
            subscriber,
            config: Arc::new(config),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    let locations = Router::new()
        .route(
            "/events/:event_id/live_locations",
            get(api::get_live_locations),
        )
        // Kept outside the per-user path space so any userId stays routable
        .route(
            "/events/:event_id/live_locations_stream",
            get(api::live_location_stream),
        )
        .route(
            "/events/:event_id/live_locations/:user_id",
            axum::routing::put(api::put_live_location).delete(api::delete_live_location),
        );

    Router::new()
        .merge(locations)
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
