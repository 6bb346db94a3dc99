//! Serial in-place replacement.
//!
//! Rolling restart replaces every active instance exactly once with a
//! worker pool of one: at any moment at most one instance is terminating
//! or missing, so availability loss is bounded to a single unit. For each
//! unit the order is fixed: LB-remove, terminate, ledger mark, launch,
//! ledger append, LB-add.

use tracing::{info, warn};

use fleetctl_cloud::LbHandle;
use fleetctl_metrics::{Operation, Phase};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

impl Engine {
    /// Replace every active instance, strictly serially.
    pub async fn rolling_restart(&self) -> EngineResult<()> {
        let _op = self.op_mu.lock().await;
        let cfg = self.config().await;
        let fleet = cfg.metadata.name.clone();

        let current = self.ledger.count_active(&fleet)?;
        if current == 0 {
            info!(fleet = %fleet, "rolling restart: no active instances");
            return Ok(());
        }
        let records = self.ledger.active_records_lifo(&fleet, current)?;

        // An LB ensure failure disables LB awareness for the remainder of
        // the operation instead of aborting it.
        let mut lb: Option<(LbHandle, u16)> = None;
        if let Some(spec) = cfg.spec.load_balancer.as_ref().filter(|s| s.enabled) {
            match self.cloud.ensure_load_balancer(&cfg).await {
                Ok(handle) => lb = Some((handle, spec.backend_port)),
                Err(err) => {
                    warn!(fleet = %fleet, error = %err, "rolling restart: lb ensure failed, continuing without lb")
                }
            }
        }

        self.metrics.reset(Operation::RollingRestart);
        self.metrics.set_rolling_restart(0, records.len());

        for (i, record) in records.iter().enumerate() {
            self.metrics.set_rolling_restart(i + 1, records.len());

            if let Some((handle, port)) = &lb {
                match self
                    .cloud
                    .instance_primary_private_ip(&cfg.spec.compartment_id, &record.id)
                    .await
                {
                    Ok(ip) => self.remove_backend_logged(handle, &ip, *port).await,
                    Err(err) => {
                        warn!(instance = %record.id, error = %err, "lb: resolve primary ip failed")
                    }
                }
            }

            self.metrics.set_phase(Phase::Terminate);
            if let Err(err) = self
                .cloud
                .terminate_instances(std::slice::from_ref(&record.id))
                .await
            {
                self.metrics.inc_terminate_failed(&err.to_string());
                return Err(EngineError::Terminate {
                    id: record.id.clone(),
                    source: err,
                });
            }
            self.metrics.inc_terminate_succeeded();
            self.ledger
                .mark_terminated_by_ids(&fleet, std::slice::from_ref(&record.id))?;
            info!(instance = %record.id, name = %record.name, "rolling restart: terminated");

            self.metrics.set_phase(Phase::Launch);
            let created = match self.cloud.launch_instances(&cfg, &record.group, 1).await {
                Ok(created) => created,
                Err(err) => {
                    self.metrics.inc_launch_failed(&err.to_string());
                    return Err(EngineError::Replace {
                        id: record.id.clone(),
                        source: err,
                    });
                }
            };
            for instance in &created {
                self.ledger.add_active_record(
                    &fleet,
                    &record.group,
                    &instance.id,
                    &instance.display_name,
                )?;
                self.metrics.inc_launch_succeeded();

                if let Some((handle, port)) = &lb {
                    match self
                        .cloud
                        .instance_primary_private_ip(&cfg.spec.compartment_id, &instance.id)
                        .await
                    {
                        Ok(ip) => self.add_backend_logged(handle, &ip, *port).await,
                        Err(err) => {
                            warn!(instance = %instance.id, error = %err, "lb: resolve primary ip failed")
                        }
                    }
                }
                info!(instance = %instance.id, name = %instance.display_name, "rolling restart: launched replacement");
            }
        }

        if let Some((handle, _)) = &lb {
            self.refresh_lb_snapshot(&fleet, handle).await;
        }
        self.metrics.done();
        Ok(())
    }
}
