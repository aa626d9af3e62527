use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures_core::Stream;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/stream", get(event_stream))
}

/// Every bus event as one SSE `data:` line of JSON, tagged by `type`.
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.bus().subscribe_all().await;

    let stream = async_stream::stream! {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => tracing::debug!("skipping unserializable bus event: {e}"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
