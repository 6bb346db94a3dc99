//! HTTP handlers.
//!
//! `POST /scale` is fire-and-forget: it enqueues the request for the
//! queue badge, spawns the operation, and returns 202 immediately — even
//! while a long-running operation holds the fleet's operation mutex.
//! Everything else answers from current state or runs synchronously.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::ApiState;

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    match state.engine.status_compare().await {
        Ok(out) => (StatusCode::OK, out),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("status error: {err}"),
        ),
    }
}

/// Composite payload shared by `/metrics` and the SSE stream.
pub(crate) async fn composite_update(state: &ApiState) -> Value {
    let cfg = state.engine.config().await;
    let fleet = cfg.metadata.name.clone();
    let local_active = state.engine.ledger().count_active(&fleet).unwrap_or(0);
    let control = state.control.snapshot();
    // Remote count comes from the control snapshot rather than a fresh
    // cloud call; the loop already polls it every tick.
    let remote_active = control.actual;
    let lb = state.engine.ledger().get_lb_info(&fleet).ok().flatten();

    let groups: Vec<Value> = cfg
        .spec
        .instances
        .iter()
        .filter(|g| g.count > 0)
        .map(|g| {
            json!({
                "name": if g.name.is_empty() { "group" } else { g.name.as_str() },
                "count": g.count,
            })
        })
        .collect();

    json!({
        "fleet": fleet,
        "localActive": local_active,
        "remoteActive": remote_active,
        "timestamp": Utc::now().to_rfc3339(),
        "control": control,
        "actions": state.engine.metrics().snapshot(),
        "lb": lb,
        "minimums": {
            "total": cfg.desired_total(),
            "groups": groups,
        },
    })
}

/// GET /metrics
pub async fn metrics(State(state): State<ApiState>) -> Json<Value> {
    Json(composite_update(&state).await)
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub desired: i64,
}

/// POST /scale
pub async fn scale(
    State(state): State<ApiState>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    if req.desired < 0 {
        return (StatusCode::BAD_REQUEST, "desired must be >= 0");
    }
    let desired = req.desired as usize;

    // Show the accepted request in the queue badge right away, unless it
    // matches what the ledger already tracks.
    let cfg = state.engine.config().await;
    let local_active = state
        .engine
        .ledger()
        .count_active(&cfg.metadata.name)
        .unwrap_or(0);
    if desired != local_active {
        state.engine.metrics().append_scale_queue(desired);
    }

    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.scale(desired).await {
            warn!(desired, error = %err, "scale failed (async)");
        }
    });
    (StatusCode::ACCEPTED, "scale accepted")
}

/// POST /rolling-restart
pub async fn rolling_restart(State(state): State<ApiState>) -> impl IntoResponse {
    match state.engine.rolling_restart().await {
        Ok(()) => (StatusCode::OK, "rolling-restart OK".to_string()),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("rolling restart failed: {err}"),
        ),
    }
}

/// POST /sync-state
pub async fn sync_state(State(state): State<ApiState>) -> impl IntoResponse {
    match state.engine.sync_state().await {
        Ok(()) => (StatusCode::OK, "sync-state OK".to_string()),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("sync-state failed: {err}"),
        ),
    }
}

/// GET /control
pub async fn control(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.control.snapshot())
}

/// GET /events — one composite update per second.
pub async fn events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold(state, |state| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let payload = composite_update(&state).await;
        let event = Event::default()
            .event("update")
            .json_data(&payload)
            .unwrap_or_else(|_| Event::default().comment("encode error"));
        Some((Ok(event), state))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
