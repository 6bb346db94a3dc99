//! Load-balancer reconciliation.
//!
//! Backend membership is cosmetic: anything that changes the count of
//! fleet members is fatal to an operation, anything that adjusts LB
//! membership is best-effort with the next reconcile tick as the safety
//! net. Per-backend mutations retry transient failures with capped
//! backoff and treat "already exists" / "not found" as success.

use std::collections::BTreeSet;

use tracing::warn;

use fleetctl_cloud::{retry, Instance, LbHandle};
use fleetctl_config::FleetConfig;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

impl Engine {
    /// Align the backend set with the live tagged instance set.
    ///
    /// Disabled in config: clears the metrics snapshot and the ledger
    /// cache. Enabled: ensures the LB exists, removes stale backends,
    /// adds missing ones, then publishes the authoritative count.
    pub async fn reconcile_load_balancer(&self) -> EngineResult<()> {
        let _op = self.op_mu.lock().await;
        let cfg = self.config().await;
        self.reconcile_lb_inner(&cfg).await
    }

    pub(crate) async fn reconcile_lb_inner(&self, cfg: &FleetConfig) -> EngineResult<()> {
        let fleet = &cfg.metadata.name;
        let Some(spec) = cfg.spec.load_balancer.as_ref().filter(|s| s.enabled) else {
            self.metrics.update_lb(false, "", 0);
            if let Err(err) = self.ledger.clear_lb(fleet) {
                warn!(fleet = %fleet, error = %err, "lb: clearing snapshot failed");
            }
            return Ok(());
        };

        let handle = match self.cloud.ensure_load_balancer(cfg).await {
            Ok(handle) => handle,
            Err(err) => {
                self.metrics.set_error(format!("lb ensure: {err}"));
                return Err(EngineError::EnsureLb(err));
            }
        };

        // Desired backends from the live tagged instances.
        let instances = self
            .cloud
            .list_instances_by_fleet(&cfg.spec.compartment_id, fleet)
            .await
            .map_err(EngineError::List)?;
        let mut desired = BTreeSet::new();
        for inst in &instances {
            match self
                .cloud
                .instance_primary_private_ip(&cfg.spec.compartment_id, &inst.id)
                .await
            {
                Ok(ip) => {
                    desired.insert(ip);
                }
                Err(err) => {
                    warn!(instance = %inst.id, error = %err, "lb: resolve primary ip failed")
                }
            }
        }

        let current: BTreeSet<String> = self
            .cloud
            .list_backends(&handle.id, &handle.backend_set)
            .await
            .map_err(EngineError::ListBackends)?
            .into_iter()
            .map(|b| b.ip_address)
            .collect();

        for ip in current.difference(&desired) {
            self.remove_backend_logged(&handle, ip, spec.backend_port)
                .await;
        }
        for ip in desired.difference(&current) {
            self.add_backend_logged(&handle, ip, spec.backend_port).await;
        }

        // Re-list for the authoritative snapshot.
        match self.cloud.list_backends(&handle.id, &handle.backend_set).await {
            Ok(backends) => {
                let ips: Vec<String> = backends.into_iter().map(|b| b.ip_address).collect();
                self.metrics.update_lb(true, &handle.id, ips.len());
                self.record_lb_handle(fleet, &handle);
                if let Err(err) = self.ledger.set_lb_backends(fleet, ips) {
                    warn!(fleet = %fleet, error = %err, "lb: recording backends failed");
                }
            }
            Err(err) => {
                warn!(fleet = %fleet, error = %err, "lb: listing backends for snapshot failed");
                self.metrics.update_lb(true, &handle.id, 0);
                self.record_lb_handle(fleet, &handle);
                if let Err(err) = self.ledger.set_lb_backends_count(fleet, 0) {
                    warn!(fleet = %fleet, error = %err, "lb: recording backend count failed");
                }
            }
        }
        Ok(())
    }

    /// Register the freshly launched instances as backends, then refresh
    /// the snapshot. Every step is log-and-continue.
    pub(crate) async fn register_new_backends(
        &self,
        cfg: &FleetConfig,
        fleet: &str,
        instances: &[Instance],
    ) {
        let Some(spec) = cfg.spec.load_balancer.as_ref().filter(|s| s.enabled) else {
            return;
        };
        let handle = match self.cloud.ensure_load_balancer(cfg).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(fleet = %fleet, error = %err, "lb: ensure failed");
                return;
            }
        };
        for inst in instances {
            match self
                .cloud
                .instance_primary_private_ip(&cfg.spec.compartment_id, &inst.id)
                .await
            {
                Ok(ip) => self.add_backend_logged(&handle, &ip, spec.backend_port).await,
                Err(err) => {
                    warn!(instance = %inst.id, error = %err, "lb: resolve primary ip failed")
                }
            }
        }
        self.refresh_lb_snapshot(fleet, &handle).await;
    }

    /// Deregister the instances selected for termination, then refresh
    /// the snapshot. Runs before any terminate is issued.
    pub(crate) async fn deregister_backends(&self, cfg: &FleetConfig, fleet: &str, ids: &[String]) {
        let Some(spec) = cfg.spec.load_balancer.as_ref().filter(|s| s.enabled) else {
            return;
        };
        let handle = match self.cloud.ensure_load_balancer(cfg).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(fleet = %fleet, error = %err, "lb: ensure failed before scale-down");
                return;
            }
        };
        for id in ids {
            match self
                .cloud
                .instance_primary_private_ip(&cfg.spec.compartment_id, id)
                .await
            {
                Ok(ip) => {
                    self.remove_backend_logged(&handle, &ip, spec.backend_port)
                        .await
                }
                Err(err) => warn!(instance = %id, error = %err, "lb: resolve primary ip failed"),
            }
        }
        self.refresh_lb_snapshot(fleet, &handle).await;
    }

    pub(crate) async fn add_backend_logged(&self, handle: &LbHandle, ip: &str, port: u16) {
        let result = retry::with_backoff("add backend", || {
            self.cloud
                .add_backend(&handle.id, &handle.backend_set, ip, port)
        })
        .await;
        match result {
            Ok(()) => {}
            // Already registered: idempotent success.
            Err(err) if err.is_already_exists() => {}
            Err(err) => {
                warn!(backend = %format!("{ip}:{port}"), error = %err, "lb: add backend failed")
            }
        }
    }

    pub(crate) async fn remove_backend_logged(&self, handle: &LbHandle, ip: &str, port: u16) {
        let result = retry::with_backoff("remove backend", || {
            self.cloud
                .remove_backend(&handle.id, &handle.backend_set, ip, port)
        })
        .await;
        match result {
            Ok(()) => {}
            // Already gone: idempotent success.
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(backend = %format!("{ip}:{port}"), error = %err, "lb: remove backend failed")
            }
        }
    }

    /// Re-count backends and publish the result to metrics + ledger.
    pub(crate) async fn refresh_lb_snapshot(&self, fleet: &str, handle: &LbHandle) {
        match self.cloud.count_backends(&handle.id, &handle.backend_set).await {
            Ok(n) => {
                self.metrics.update_lb(true, &handle.id, n);
                self.record_lb_handle(fleet, handle);
                if let Err(err) = self.ledger.set_lb_backends_count(fleet, n) {
                    warn!(fleet = %fleet, error = %err, "lb: recording backend count failed");
                }
            }
            Err(err) => {
                warn!(fleet = %fleet, error = %err, "lb: counting backends failed");
                self.metrics.update_lb(true, &handle.id, 0);
                self.record_lb_handle(fleet, handle);
                if let Err(err) = self.ledger.set_lb_backends_count(fleet, 0) {
                    warn!(fleet = %fleet, error = %err, "lb: recording backend count failed");
                }
            }
        }
    }

    fn record_lb_handle(&self, fleet: &str, handle: &LbHandle) {
        if let Err(err) = self.ledger.set_lb_info(
            fleet,
            true,
            &handle.id,
            &handle.backend_set,
            &handle.listener,
        ) {
            warn!(fleet = %fleet, error = %err, "lb: recording snapshot failed");
        }
    }
}
