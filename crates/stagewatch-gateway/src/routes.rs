use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use stagewatch_core::types::{GraphState, SessionEvent};

use crate::state::AppState;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn unavailable(state: &AppState) -> Response {
    let reason = state
        .layout_error
        .read()
        .clone()
        .unwrap_or_else(|| "layout not loaded yet".to_string());
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "status": "graph unavailable",
            "reason": reason,
        })),
    )
        .into_response()
}

// GET /api/state
pub async fn current_state(State(state): State<Arc<AppState>>) -> Response {
    match state.store.current_state() {
        Ok(graph) => Json(graph).into_response(),
        Err(_) => unavailable(&state),
    }
}

// GET /api/nodes/{id}
pub async fn node_detail(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let graph = match state.store.current_state() {
        Ok(graph) => graph,
        Err(_) => return unavailable(&state),
    };
    match graph.node(&id) {
        Some(node) => Json(serde_json::json!({
            "node": node,
            "status": graph.status(&id),
            "upstream": graph.upstream_of(&id),
            "generation": graph.generation,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown node: {}", id) })),
        )
            .into_response(),
    }
}

fn state_event(graph: &GraphState) -> Result<Event, Infallible> {
    let event = Event::default()
        .event("state")
        .id(graph.generation.to_string());
    Ok(match event.json_data(graph) {
        Ok(event) => event,
        Err(e) => Event::default().event("error").data(e.to_string()),
    })
}

// GET /api/state/stream: the current state, then every new one
pub async fn state_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading so no publish falls between the two
    let rx = state.event_bus.subscribe();
    let initial = state.store.current_state().ok();

    let updates = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::StateChanged(graph)) => return Some((graph, rx)),
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => return None,
                Ok(_) => continue,
                // Every state is complete, so skipping some is harmless
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "State stream subscriber lagged");
                    continue;
                }
            }
        }
    });

    let skip_until = initial.as_ref().map(|g| g.generation);
    let events = stream::iter(initial)
        .chain(updates.filter(move |graph| {
            let fresh = skip_until.map_or(true, |gen| graph.generation > gen);
            futures::future::ready(fresh)
        }))
        .map(|graph| state_event(&graph));

    Sse::new(events).keep_alive(KeepAlive::default())
}
