//! fleetctl-api — HTTP surface for daemon mode.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness probe |
//! | GET | `/status` | Local vs remote status, plain text |
//! | GET | `/metrics` | Composite JSON: counts, control, actions, lb |
//! | POST | `/scale` | Fire-and-forget scale to a desired total (202) |
//! | POST | `/rolling-restart` | Serial rolling restart (synchronous) |
//! | POST | `/sync-state` | Rebuild the ledger from the cloud |
//! | GET | `/control` | Control-loop snapshot JSON |
//! | GET | `/events` | SSE: one composite update per second |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use fleetctl_engine::{ControlState, Engine};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub control: Arc<ControlState>,
}

/// Build the daemon router.
pub fn build_router(engine: Arc<Engine>, control: Arc<ControlState>) -> Router {
    let state = ApiState { engine, control };
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/status", get(handlers::status))
        .route("/metrics", get(handlers::metrics))
        .route("/scale", post(handlers::scale))
        .route("/rolling-restart", post(handlers::rolling_restart))
        .route("/sync-state", post(handlers::sync_state))
        .route("/control", get(handlers::control))
        .route("/events", get(handlers::events))
        .with_state(state)
}
