//! Live visit stream for the visitor map

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use serde_json::json;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::AppState;
use crate::feed::FeedState;

/// `snapshot` once with the current total, then one `visit` per recorded visit
pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe first so no visit falls between the snapshot and the stream
    let rx = state.event_bus.subscribe();

    let greeting = match state.feed.state().await {
        FeedState::Ready {
            snapshot,
            refreshed_at,
            ..
        } => Some(
            Event::default()
                .event("snapshot")
                .data(json!({ "total_visitors": snapshot.total_visitors, "refreshed_at": refreshed_at }).to_string()),
        ),
        _ => None,
    };

    // Lagged receivers just skip the missed visits
    let visits = BroadcastStream::new(rx).filter_map(|result| {
        let event = result.ok()?;
        let json = serde_json::to_string(&*event).ok()?;
        Some(Event::default().event("visit").data(json))
    });

    let events = stream::iter(greeting).chain(visits).map(Ok);

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
