//! Server-Sent Events stream of the filtered active view
//!
//! Every change in the store, plus every periodic re-filter that changes
//! membership, becomes a `live_locations` event. A failing subscription
//! produces one `subscription_error` event and ends the stream.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

use safetrack_common::presence::EventId;

use crate::AppState;

/// GET /events/:event_id/live_locations_stream
pub async fn live_location_stream(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let event_id = EventId::new(event_id);
    info!(event = %event_id, "New live location SSE client");

    let stream = async_stream::stream! {
        let mut feed = match state.subscriber.subscribe(&event_id).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(event = %event_id, "Live location subscription failed: {}", e);
                yield Ok(Event::default().event("subscription_error").data(e.to_string()));
                return;
            }
        };

        while let Some(update) = feed.next().await {
            match update {
                Ok(view) => {
                    debug!(event = %event_id, active = view.len(), "Pushing live locations");
                    match Event::default().event("live_locations").json_data(&view) {
                        Ok(event) => yield Ok(event),
                        Err(e) => warn!("Failed to serialize active view: {}", e),
                    }
                }
                Err(e) => {
                    warn!(event = %event_id, "Live location subscription ended: {}", e);
                    yield Ok(Event::default().event("subscription_error").data(e.to_string()));
                    break;
                }
            }
        }

        feed.close();
        debug!(event = %event_id, "Live location SSE stream finished");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
