//! The reconciliation engine.
//!
//! `Engine` serializes every mutating operation on a fleet behind a single
//! operation mutex — scale, rolling restart, state sync, and load-balancer
//! reconciliation observe a total order, and holding the lock may take
//! minutes. Read-only surfaces (`status_compare`, the metrics snapshot) do
//! not take it.
//!
//! The engine never plans remote changes from the ledger alone: the
//! tag-filtered cloud listing is the truth for reconciliation, while the
//! ledger supplies group-selection memory and the control loop's floor.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use fleetctl_cloud::{CloudError, CloudProvider, Instance};
use fleetctl_config::FleetConfig;
use fleetctl_ledger::{InstanceRecord, InstanceStatus, Ledger};
use fleetctl_metrics::{Operation, Phase, Registry};

use crate::error::{EngineError, EngineResult};

/// Interval between convergence polls after a scale.
const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Wall-clock deadline for a scale to converge.
const VERIFY_DEADLINE: Duration = Duration::from_secs(120);

/// Per-fleet reconciliation engine.
pub struct Engine {
    pub(crate) config: RwLock<Arc<FleetConfig>>,
    pub(crate) cloud: Arc<dyn CloudProvider>,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) metrics: Arc<Registry>,
    /// Serializes every mutating operation on this fleet.
    pub(crate) op_mu: Mutex<()>,
}

impl Engine {
    pub fn new(
        config: FleetConfig,
        cloud: Arc<dyn CloudProvider>,
        ledger: Arc<Ledger>,
        metrics: Arc<Registry>,
    ) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            cloud,
            ledger,
            metrics,
            op_mu: Mutex::new(()),
        }
    }

    /// Current configuration. Operations re-read this at phase boundaries.
    pub async fn config(&self) -> Arc<FleetConfig> {
        self.config.read().await.clone()
    }

    /// Replace the configuration wholesale. Takes the operation mutex so
    /// the swap never lands mid-operation.
    pub async fn swap_config(&self, config: FleetConfig) {
        let _op = self.op_mu.lock().await;
        *self.config.write().await = Arc::new(config);
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn metrics(&self) -> &Registry {
        &self.metrics
    }

    /// Count of tagged, non-terminated instances in the cloud.
    pub async fn remote_count(&self) -> EngineResult<usize> {
        let cfg = self.config().await;
        let instances = self
            .cloud
            .list_instances_by_fleet(&cfg.spec.compartment_id, &cfg.metadata.name)
            .await
            .map_err(EngineError::List)?;
        Ok(instances.len())
    }

    /// Drive the fleet to `desired` total instances.
    ///
    /// The remote tag-filtered count decides the direction; a listing
    /// failure falls back to the local count with a warning. Completed
    /// launches are never rolled back on a partial failure. Ends with a
    /// convergence poll and a ledger rebuild from the cloud.
    pub async fn scale(&self, desired: usize) -> EngineResult<()> {
        let _op = self.op_mu.lock().await;
        self.metrics.pop_scale_queue_if_head(desired);

        let cfg = self.config().await;
        let fleet = cfg.metadata.name.clone();
        let local = self.ledger.count_active(&fleet)?;
        let remote = match self
            .cloud
            .list_instances_by_fleet(&cfg.spec.compartment_id, &fleet)
            .await
        {
            Ok(instances) => instances.len(),
            Err(err) => {
                warn!(
                    fleet = %fleet,
                    error = %err,
                    "scale: could not list remote instances, falling back to local state"
                );
                local
            }
        };

        if desired == local && desired == remote {
            info!(fleet = %fleet, desired, local, remote, "scale: no changes needed");
            return Ok(());
        }

        let group = cfg.default_group();
        if desired > remote {
            self.scale_up(&cfg, &fleet, &group, remote, desired).await?;
        } else {
            self.scale_down(&cfg, &fleet, local, remote, desired).await?;
        }

        self.metrics.set_phase(Phase::Verify);
        if let Err(err) = self.verify_actual_matches(&cfg, desired).await {
            self.metrics.set_error(err.to_string());
            return Err(err);
        }
        self.sync_state_inner(&cfg).await?;
        self.metrics.done();
        Ok(())
    }

    async fn scale_up(
        &self,
        cfg: &Arc<FleetConfig>,
        fleet: &str,
        group: &str,
        remote: usize,
        desired: usize,
    ) -> EngineResult<()> {
        let missing = desired - remote;
        self.metrics.reset(Operation::ScaleUp);
        self.metrics.set_scale_targets(remote, desired);
        self.metrics.set_phase(Phase::Launch);
        self.metrics.inc_launch_requested(missing);

        // Each worker launches exactly one instance; the semaphore bounds
        // in-flight launches to the configured pool size.
        let sem = Arc::new(Semaphore::new(cfg.parallel_launch()));
        let mut pool = JoinSet::new();
        for _ in 0..missing {
            let sem = Arc::clone(&sem);
            let cloud = Arc::clone(&self.cloud);
            let cfg = Arc::clone(cfg);
            let group = group.to_string();
            pool.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .expect("launch pool semaphore closed");
                let mut created = cloud.launch_instances(&cfg, &group, 1).await?;
                created
                    .pop()
                    .ok_or_else(|| CloudError::Failed("launch returned no instance".into()))
            });
        }

        let mut launched: Vec<Instance> = Vec::with_capacity(missing);
        let mut first_failure: Option<CloudError> = None;
        while let Some(joined) = pool.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(CloudError::Failed(format!("launch worker panicked: {err}")))
            });
            match result {
                Ok(instance) => launched.push(instance),
                Err(err) => {
                    self.metrics.inc_launch_failed(&err.to_string());
                    first_failure.get_or_insert(err);
                }
            }
        }

        // Completed launches are recorded even when the operation aborts.
        for instance in &launched {
            self.ledger
                .add_active_record(fleet, group, &instance.id, &instance.display_name)?;
            self.metrics.inc_launch_succeeded();
        }
        if let Some(err) = first_failure {
            return Err(EngineError::Launch(err));
        }
        info!(fleet = %fleet, launched = launched.len(), desired, "scale: launched instances");

        if cfg.lb_enabled() {
            self.register_new_backends(cfg, fleet, &launched).await;
        }
        Ok(())
    }

    async fn scale_down(
        &self,
        cfg: &Arc<FleetConfig>,
        fleet: &str,
        local: usize,
        remote: usize,
        desired: usize,
    ) -> EngineResult<()> {
        self.metrics.reset(Operation::ScaleDown);
        self.metrics.set_scale_targets(remote, desired);

        // Selection counts from the ledger: remove what we know we own.
        let to_remove = local.saturating_sub(desired);
        let records = self.ledger.active_records_lifo(fleet, to_remove)?;
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();

        // Deregistration completes before any terminate begins.
        if cfg.lb_enabled() && !ids.is_empty() {
            self.deregister_backends(cfg, fleet, &ids).await;
        }

        self.metrics.set_phase(Phase::Terminate);
        self.metrics.inc_terminate_requested(ids.len());

        let sem = Arc::new(Semaphore::new(cfg.parallel_terminate()));
        let mut pool = JoinSet::new();
        for id in ids.clone() {
            let sem = Arc::clone(&sem);
            let cloud = Arc::clone(&self.cloud);
            pool.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .expect("terminate pool semaphore closed");
                match cloud.terminate_instances(std::slice::from_ref(&id)).await {
                    Ok(()) => Ok(()),
                    Err(err) => Err((id, err)),
                }
            });
        }

        let mut first_failure: Option<EngineError> = None;
        let mut terminated = 0usize;
        while let Some(joined) = pool.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err((
                    String::new(),
                    CloudError::Failed(format!("terminate worker panicked: {err}")),
                ))
            });
            match result {
                Ok(()) => {
                    self.metrics.inc_terminate_succeeded();
                    terminated += 1;
                }
                Err((id, err)) => {
                    self.metrics.inc_terminate_failed(&err.to_string());
                    first_failure.get_or_insert(EngineError::Terminate { id, source: err });
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }

        self.ledger.mark_terminated_by_ids(fleet, &ids)?;
        info!(fleet = %fleet, terminated, desired, "scale: terminated instances");
        Ok(())
    }

    /// Poll the tag-filtered listing until it matches `desired` or the
    /// deadline elapses.
    async fn verify_actual_matches(&self, cfg: &FleetConfig, desired: usize) -> EngineResult<()> {
        let fleet = &cfg.metadata.name;
        let deadline = Instant::now() + VERIFY_DEADLINE;
        loop {
            let actual = self
                .cloud
                .list_instances_by_fleet(&cfg.spec.compartment_id, fleet)
                .await
                .map_err(EngineError::List)?
                .len();
            if actual == desired {
                info!(fleet = %fleet, actual, "scale verify: converged");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::VerifyTimeout { actual, desired });
            }
            debug!(fleet = %fleet, actual, desired, "scale verify: waiting");
            tokio::time::sleep(VERIFY_POLL_INTERVAL).await;
        }
    }

    /// Rebuild the ledger from the cloud, treating the tag-filtered
    /// listing as the source of truth for the Active set. Does not touch
    /// instances or the load balancer.
    pub async fn sync_state(&self) -> EngineResult<()> {
        let _op = self.op_mu.lock().await;
        let cfg = self.config().await;
        self.sync_state_inner(&cfg).await
    }

    pub(crate) async fn sync_state_inner(&self, cfg: &FleetConfig) -> EngineResult<()> {
        let fleet = &cfg.metadata.name;
        let instances = self
            .cloud
            .list_instances_by_fleet(&cfg.spec.compartment_id, fleet)
            .await
            .map_err(EngineError::List)?;

        let now = Utc::now();
        let prefix = cfg.display_name_prefix();
        let records: Vec<InstanceRecord> = instances
            .iter()
            .map(|inst| InstanceRecord {
                id: inst.id.clone(),
                group: parse_group(&inst.display_name, &prefix),
                name: inst.display_name.clone(),
                status: InstanceStatus::Active,
                // Origin timestamps are unrecoverable from the listing.
                created_at: now,
                updated_at: now,
            })
            .collect();

        let active = records.len();
        self.ledger.reset_fleet_active(fleet, records)?;
        info!(fleet = %fleet, active, "sync-state: rebuilt ledger from cloud");
        Ok(())
    }

    /// Composite status text: local vs remote counts, local detail, drift
    /// indication, and the cached LB snapshot. Read-only.
    pub async fn status_compare(&self) -> EngineResult<String> {
        let cfg = self.config().await;
        let fleet = &cfg.metadata.name;

        let local_summary = self.ledger.summary(fleet)?;
        let local_active = self.ledger.count_active(fleet)?;
        let remote_active = self
            .cloud
            .list_instances_by_fleet(&cfg.spec.compartment_id, fleet)
            .await
            .map_err(EngineError::List)?
            .len();

        let mut out = format!("Status for fleet {fleet:?}:\n");
        let _ = writeln!(out, "  Local active:  {local_active}");
        let _ = writeln!(out, "  Remote active: {remote_active}\n");
        out.push_str("Local state detail:\n");
        out.push_str(&local_summary);

        if local_active != remote_active {
            let _ = write!(
                out,
                "\n\nDrift detected: local={local_active} actual={remote_active}"
            );
        } else {
            out.push_str("\n\nLocal and actual counts match.");
        }

        match self.ledger.get_lb_info(fleet)? {
            Some(lb) => {
                out.push_str("\n\nLoad Balancer:");
                let _ = write!(out, "\n  Enabled: {}", lb.enabled);
                let _ = write!(out, "\n  ID: {}", lb.id);
                let _ = write!(out, "\n  BackendSet: {}", lb.backend_set);
                let _ = write!(out, "\n  Listener: {}", lb.listener);
                let _ = write!(out, "\n  Backends: {}", lb.backends_count);
                let _ = write!(out, "\n  UpdatedAt: {}", lb.updated_at.to_rfc3339());
            }
            None => out.push_str("\n\nLoad Balancer: (no snapshot)"),
        }
        Ok(out)
    }
}

/// Best-effort group extraction from `<prefix><group>-<timestamp>-<idx>`.
fn parse_group(display_name: &str, prefix: &str) -> String {
    let Some(rest) = display_name.strip_prefix(prefix) else {
        return "default".to_string();
    };
    match rest.find('-') {
        Some(idx) if idx > 0 => rest[..idx].to_string(),
        _ => "default".to_string(),
    }
}
