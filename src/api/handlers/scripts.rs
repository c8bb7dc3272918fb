use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;

use crate::{
    error::AppResult,
    services::{auth::Claims, scripts::ScriptRunner},
    AppState,
};

use super::sse_event;

#[derive(Debug, Serialize)]
pub struct ScriptList {
    pub scripts: Vec<String>,
}

pub async fn list_scripts(State(state): State<AppState>) -> Json<ScriptList> {
    let runner = ScriptRunner::new(&state.config.scripts);

    Json(ScriptList {
        scripts: runner.list().to_vec(),
    })
}

/// Runs an allow-listed script and streams its output as `stdout`,
/// `stderr` and a final `done` event.
pub async fn run_script(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(name): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let runner = ScriptRunner::new(&state.config.scripts);
    let rx = runner.run(&name)?;
    tracing::info!("Admin {} started script {}", claims.sub, name);

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event| sse_event(event.name(), &event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
