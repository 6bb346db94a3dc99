//! The periodic control loop.
//!
//! Each tick: reload the configuration if its mtime advanced, compute
//! `target = max(declared total, ledger active count)`, list the cloud,
//! scale up when actual falls short, and always reconcile the load
//! balancer. The ledger acts as a floor — the loop never drives below
//! what the controller knows it owns, and never downscales.
//!
//! Ticks cannot overlap: the body runs, then the loop sleeps, and every
//! mutating step serializes on the engine's operation mutex anyway.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetctl_config::FleetConfig;

use crate::engine::Engine;

/// Published view of the control loop, served by `/control`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSnapshot {
    pub enabled: bool,
    pub interval: String,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_config_reload: Option<DateTime<Utc>>,
    /// Target after the ledger lower-bound is applied.
    pub desired: usize,
    /// Last observed remote count.
    pub actual: usize,
    pub last_action: String,
    pub last_error: String,
    pub loop_count: u64,
}

/// Mutex-protected control-loop state, shared with the status surface.
#[derive(Default)]
pub struct ControlState {
    inner: Mutex<ControlSnapshot>,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut ControlSnapshot)) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut inner);
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Background reconcile loop for daemon mode.
pub struct ControlLoop {
    engine: Arc<Engine>,
    state: Arc<ControlState>,
    config_path: PathBuf,
    interval: Duration,
    last_modified: Option<SystemTime>,
}

impl ControlLoop {
    pub fn new(
        engine: Arc<Engine>,
        state: Arc<ControlState>,
        config_path: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            state,
            config_path,
            interval,
            last_modified: None,
        }
    }

    /// Run until the shutdown signal fires. The tick body executes first,
    /// then the loop waits out the interval, so a long iteration delays
    /// the next tick rather than overlapping it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            config = %self.config_path.display(),
            "control loop started"
        );
        self.state.update(|c| {
            c.enabled = true;
            c.interval = format!("{}s", self.interval.as_secs());
            c.last_error.clear();
        });

        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }

    /// One reconcile iteration. Public so command mode and tests can
    /// drive the loop body directly.
    pub async fn tick(&mut self) {
        self.state.update(|c| {
            c.last_tick = Some(Utc::now());
            c.loop_count += 1;
        });

        self.maybe_reload_config().await;

        let cfg = self.engine.config().await;
        let fleet = cfg.metadata.name.clone();
        let declared = cfg.desired_total();
        let floor = match self.engine.ledger().count_active(&fleet) {
            Ok(n) => n,
            Err(err) => {
                warn!(fleet = %fleet, error = %err, "control: reading ledger failed");
                0
            }
        };
        let target = declared.max(floor);
        self.state.update(|c| c.desired = target);

        match self.engine.remote_count().await {
            Err(err) => {
                self.state.update(|c| c.last_error = err.to_string());
                warn!(fleet = %fleet, error = %err, "control: list instances failed");
            }
            Ok(actual) => {
                self.state.update(|c| {
                    c.actual = actual;
                    c.last_error.clear();
                });
                if actual < target {
                    self.state
                        .update(|c| c.last_action = format!("scale up to {target}"));
                    info!(fleet = %fleet, target, actual, "control: scaling up to meet target");
                    if let Err(err) = self.engine.scale(target).await {
                        self.state.update(|c| c.last_error = err.to_string());
                        warn!(fleet = %fleet, target, error = %err, "control: scale failed");
                    }
                } else {
                    self.state.update(|c| c.last_action = "noop".to_string());
                    debug!(fleet = %fleet, actual, target, "control: actual meets target, no downscale");
                }
            }
        }

        self.state
            .update(|c| c.last_action = "lb-reconcile".to_string());
        if let Err(err) = self.engine.reconcile_load_balancer().await {
            self.state.update(|c| c.last_error = err.to_string());
            warn!(fleet = %fleet, error = %err, "control: lb reconcile failed");
        } else {
            self.state.update(|c| c.last_error.clear());
        }
    }

    /// Re-parse the configuration when its mtime advances. A parse
    /// failure keeps the previous configuration active.
    async fn maybe_reload_config(&mut self) {
        let modified = match std::fs::metadata(&self.config_path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(err) => {
                self.state.update(|c| c.last_error = err.to_string());
                warn!(path = %self.config_path.display(), error = %err, "control: stat config failed");
                return;
            }
        };
        if self.last_modified.is_some_and(|last| modified <= last) {
            return;
        }
        match FleetConfig::from_file(&self.config_path) {
            Ok(cfg) => {
                self.engine.swap_config(cfg).await;
                self.last_modified = Some(modified);
                let at: DateTime<Utc> = modified.into();
                self.state.update(|c| {
                    c.last_config_reload = Some(at);
                    c.last_error.clear();
                });
                info!(path = %self.config_path.display(), "control: reloaded config");
            }
            Err(err) => {
                warn!(
                    path = %self.config_path.display(),
                    error = %err,
                    "control: config reload failed, keeping previous config"
                );
            }
        }
    }
}
