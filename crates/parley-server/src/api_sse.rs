//! SSE event stream handler.

use crate::api::ApiError;
use crate::AppState;
use axum::{
    extract::{Extension, Path},
    response::{sse::Event, Sse},
};
use futures_util::Stream;
use parley_engine::external_events;
use std::{convert::Infallible, sync::Arc};
use tokio_stream::StreamExt;

/// Handler for `GET /events/stream/{id}`.
///
/// Streams the session's client events until a terminal error or session
/// end, each named by its `type` in the SSE `event:` field. A session
/// accepts one stream at a time; a second request gets 409.
pub async fn event_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let engine = state.registry.get(&session_id).await?;
    let subscription = crate::api::engine_call(&state, &session_id, engine.subscribe()).await?;

    let stream = external_events(subscription, engine.audio_format()).filter_map(move |event| {
        match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default().event(event.name()).data(data))),
            Err(e) => {
                tracing::error!(session_id = %session_id, "failed to serialize client event: {}", e);
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()))
}
