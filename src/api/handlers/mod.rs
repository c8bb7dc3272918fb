pub mod auth;
pub mod downloads;
pub mod packs;
pub mod scripts;
pub mod stickers;
pub mod tools;

use std::convert::Infallible;

use axum::response::sse::Event;
use serde::Serialize;

/// Named SSE event with a JSON payload.
fn sse_event<T: Serialize>(name: &'static str, payload: &T) -> Result<Event, Infallible> {
    let event = Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize {} event: {}", name, e);
            Event::default().event("error").data(e.to_string())
        });
    Ok(event)
}
