//! Daemon mode: control loop + HTTP server with graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use fleetctl_api::build_router;
use fleetctl_engine::{ControlLoop, ControlState, Engine};

pub async fn serve(
    engine: Arc<Engine>,
    config_path: PathBuf,
    listen: String,
    reconcile_every: Duration,
) -> anyhow::Result<()> {
    let control = Arc::new(ControlState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(
        interval_secs = reconcile_every.as_secs(),
        config = %config_path.display(),
        "starting control loop"
    );
    let control_loop = ControlLoop::new(
        Arc::clone(&engine),
        Arc::clone(&control),
        config_path,
        reconcile_every,
    );
    let loop_handle = tokio::spawn(control_loop.run(shutdown_rx));

    let addr = normalize_listen(&listen);
    let router = build_router(engine, control);
    info!(%addr, "HTTP server starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = loop_handle.await;
    info!("daemon stopped");
    Ok(())
}

/// Allow a bare port: `8080` becomes `0.0.0.0:8080`.
fn normalize_listen(addr: &str) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("0.0.0.0:{addr}")
    }
}
