//! fleetctl-metrics — the live view of "what is the controller doing".
//!
//! One [`Registry`] per process describes the currently executing engine
//! operation: kind, phase, per-phase tallies, scale targets, load-balancer
//! snapshot, and the pending scale queue. The engine writes it, the status
//! surface reads it via [`Registry::snapshot`], a plain value copy.
//!
//! Lifecycle: [`Registry::reset`] at the start of an operation, phase and
//! counter setters while it runs, [`Registry::done`] at the end. `done`
//! clears the operation (the UI badge returns to idle) but leaves the
//! counters observable until the next reset.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    ScaleUp,
    ScaleDown,
    RollingRestart,
    SyncState,
}

/// Stage within an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Launch,
    Terminate,
    Verify,
    Done,
}

/// Value copy of the register, in the wire shape served by `/metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub operation: Option<Operation>,
    pub phase: Option<Phase>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,

    pub launch_requested: usize,
    pub launch_succeeded: usize,
    pub launch_failed: usize,

    pub terminate_requested: usize,
    pub terminate_succeeded: usize,
    pub terminate_failed: usize,

    /// 1-based index of the unit currently being replaced.
    pub rolling_restart_index: usize,
    pub rolling_restart_total: usize,

    /// Instance count when the scale began.
    pub start_total: usize,
    /// Instance count the scale is driving toward.
    pub target_total: usize,

    pub lb_enabled: bool,
    pub lb_id: String,
    pub lb_backends: usize,

    /// Accepted-but-not-yet-started scale requests, oldest first.
    pub scale_queue: Vec<usize>,

    pub last_error: String,
}

/// Mutex-protected operation register. The daemon creates exactly one and
/// shares it between the engine and the HTTP surface.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<MetricsSnapshot>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MetricsSnapshot) -> T) -> T {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut inner)
    }

    fn touch(inner: &mut MetricsSnapshot) {
        inner.last_update = Some(Utc::now());
    }

    /// Begin a new operation: clears counters, sets phase to planning.
    /// The scale queue and LB snapshot survive across operations.
    pub fn reset(&self, operation: Operation) {
        self.with(|m| {
            let now = Utc::now();
            let queue = std::mem::take(&mut m.scale_queue);
            let (lb_enabled, lb_id, lb_backends) =
                (m.lb_enabled, std::mem::take(&mut m.lb_id), m.lb_backends);
            *m = MetricsSnapshot {
                operation: Some(operation),
                phase: Some(Phase::Planning),
                started_at: Some(now),
                last_update: Some(now),
                scale_queue: queue,
                lb_enabled,
                lb_id,
                lb_backends,
                ..MetricsSnapshot::default()
            };
        });
    }

    /// Mark the current operation complete and return the badge to idle.
    pub fn done(&self) {
        self.with(|m| {
            m.phase = Some(Phase::Done);
            m.operation = None;
            Self::touch(m);
        });
    }

    pub fn set_phase(&self, phase: Phase) {
        self.with(|m| {
            m.phase = Some(phase);
            Self::touch(m);
        });
    }

    pub fn set_error(&self, err: impl Into<String>) {
        self.with(|m| {
            m.last_error = err.into();
            Self::touch(m);
        });
    }

    /// Record where a scale started and where it is headed.
    pub fn set_scale_targets(&self, start: usize, target: usize) {
        self.with(|m| {
            m.start_total = start;
            m.target_total = target;
            Self::touch(m);
        });
    }

    pub fn inc_launch_requested(&self, n: usize) {
        self.with(|m| {
            m.launch_requested += n;
            Self::touch(m);
        });
    }

    pub fn inc_launch_succeeded(&self) {
        self.with(|m| {
            m.launch_succeeded += 1;
            Self::touch(m);
        });
    }

    pub fn inc_launch_failed(&self, err: &str) {
        self.with(|m| {
            m.launch_failed += 1;
            if !err.is_empty() {
                m.last_error = err.to_string();
            }
            Self::touch(m);
        });
    }

    pub fn inc_terminate_requested(&self, n: usize) {
        self.with(|m| {
            m.terminate_requested += n;
            Self::touch(m);
        });
    }

    pub fn inc_terminate_succeeded(&self) {
        self.with(|m| {
            m.terminate_succeeded += 1;
            Self::touch(m);
        });
    }

    pub fn inc_terminate_failed(&self, err: &str) {
        self.with(|m| {
            m.terminate_failed += 1;
            if !err.is_empty() {
                m.last_error = err.to_string();
            }
            Self::touch(m);
        });
    }

    /// Progress of a rolling restart: `index` is 1-based.
    pub fn set_rolling_restart(&self, index: usize, total: usize) {
        self.with(|m| {
            m.rolling_restart_index = index;
            m.rolling_restart_total = total;
            Self::touch(m);
        });
    }

    /// Publish the reconciled load-balancer state.
    pub fn update_lb(&self, enabled: bool, id: &str, backends: usize) {
        self.with(|m| {
            m.lb_enabled = enabled;
            m.lb_id = id.to_string();
            m.lb_backends = backends;
            Self::touch(m);
        });
    }

    /// Append an accepted scale request to the diagnostic queue.
    pub fn append_scale_queue(&self, desired: usize) {
        self.with(|m| {
            m.scale_queue.push(desired);
            Self::touch(m);
        });
    }

    /// Pop the queue head iff it equals `desired`; called when a scale
    /// operation actually begins. Returns whether a pop happened.
    pub fn pop_scale_queue_if_head(&self, desired: usize) -> bool {
        self.with(|m| {
            if m.scale_queue.first() == Some(&desired) {
                m.scale_queue.remove(0);
                Self::touch(m);
                true
            } else {
                false
            }
        })
    }

    /// Plain value copy of the current register.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with(|m| m.clone())
    }
}
