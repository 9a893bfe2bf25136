//! Session stream handlers
//!
//! `open_stream` bridges a registry stream onto SSE. The consumer half
//! owns the registry entry: when the HTTP connection goes away, axum
//! drops the stream, the registry entry is removed, and any in-flight
//! pipeline for the session is cancelled.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;

use crate::AppState;
use ragline_common::errors::Result;
use ragline_engine::StreamFrame;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Serialize)]
pub struct CloseStreamResponse {
    /// False when no stream was open for the session
    pub closed: bool,
}

fn sse_event(frame: StreamFrame) -> Event {
    Event::default().event(frame.event).data(frame.data)
}

/// Open the session's push stream
pub async fn open_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let stream = state.registry.create(&session_id)?;
    tracing::info!(session = %session_id, "Stream connected");

    let events = stream.map(|frame| Ok(sse_event(frame)));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}

/// Cancel the session's stream. Idempotent: closing a session with no
/// open stream reports `closed: false` instead of an error.
pub async fn close_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<CloseStreamResponse> {
    let closed = state.registry.remove(&session_id, "client_request");
    tracing::info!(session = %session_id, closed, "Stream close requested");

    Json(CloseStreamResponse { closed })
}
