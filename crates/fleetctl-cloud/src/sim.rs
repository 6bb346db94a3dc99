//! In-process simulated cloud.
//!
//! `SimCloud` implements the full provider surface against in-memory
//! state: launches return immediately in the running state with stable
//! fake OCIDs and private IPs, terminations flip lifecycle, and the load
//! balancer is a named set of `ip:port` backends. It backs the `simulated`
//! auth method for local development and the engine/API test suites.
//!
//! Failure injection knobs let tests exercise abort paths: launches can be
//! made to fail after the first `k` successes, and backend mutations can
//! be made to throttle a fixed number of times.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use fleetctl_config::FleetConfig;

use crate::error::{CloudError, CloudResult};
use crate::provider::{
    fleet_tags, AuthInfo, Backend, CloudProvider, Instance, LbHandle, Lifecycle, FLEET_TAG_KEY,
};

#[derive(Debug, Clone)]
struct SimInstance {
    id: String,
    display_name: String,
    tags: HashMap<String, String>,
    ip: String,
    lifecycle: Lifecycle,
}

#[derive(Debug, Default)]
struct SimLb {
    id: String,
    backends: BTreeSet<Backend>,
}

#[derive(Debug, Default)]
struct SimState {
    instances: Vec<SimInstance>,
    /// Load balancers keyed by display name.
    lbs: HashMap<String, SimLb>,
    /// Remaining launch calls that succeed before failures kick in.
    /// `None` means never fail.
    launches_before_failure: Option<u64>,
    /// Remaining backend mutations that return a throttle error.
    backend_throttles: u64,
}

/// Simulated cloud backend. Clone-free; share via `Arc`.
#[derive(Default)]
pub struct SimCloud {
    state: Mutex<SimState>,
    counter: AtomicU64,
}

impl SimCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Let the next `n` launch calls succeed, then fail every launch after
    /// them. Test hook.
    pub fn fail_launches_after(&self, n: u64) {
        self.lock().launches_before_failure = Some(n);
    }

    /// Make the next `n` backend add/remove calls return a throttle
    /// error. Test hook.
    pub fn throttle_backend_calls(&self, n: u64) {
        self.lock().backend_throttles = n;
    }

    /// Ids of all non-terminated instances, regardless of fleet. Test hook.
    pub fn live_instance_ids(&self) -> Vec<String> {
        self.lock()
            .instances
            .iter()
            .filter(|i| i.lifecycle != Lifecycle::Terminated)
            .map(|i| i.id.clone())
            .collect()
    }
}

#[async_trait]
impl CloudProvider for SimCloud {
    async fn list_instances_by_fleet(
        &self,
        _compartment_id: &str,
        fleet: &str,
    ) -> CloudResult<Vec<Instance>> {
        let state = self.lock();
        Ok(state
            .instances
            .iter()
            .filter(|i| i.lifecycle != Lifecycle::Terminated)
            .filter(|i| i.tags.get(FLEET_TAG_KEY).map(String::as_str) == Some(fleet))
            .map(|i| Instance {
                id: i.id.clone(),
                display_name: i.display_name.clone(),
                lifecycle: i.lifecycle,
            })
            .collect())
    }

    async fn launch_instances(
        &self,
        cfg: &FleetConfig,
        group: &str,
        n: usize,
    ) -> CloudResult<Vec<Instance>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let subnet = cfg.subnet_for_group(group);
        if subnet.is_empty() {
            return Err(CloudError::Failed(format!(
                "no subnetId specified for group {group:?}"
            )));
        }
        let prefix = cfg.display_name_prefix();
        let mut out = Vec::with_capacity(n);
        let mut state = self.lock();
        for idx in 0..n {
            if let Some(remaining) = state.launches_before_failure.as_mut() {
                if *remaining == 0 {
                    return Err(CloudError::Failed("simulated launch failure".into()));
                }
                *remaining -= 1;
            }
            let seq = self.next_seq();
            let id = format!("ocid1.instance.sim..{seq:08}");
            let name = format!(
                "{prefix}{group}-{ts}-{idx}",
                ts = chrono::Utc::now().timestamp_millis()
            );
            let ip = format!("10.0.{}.{}", (seq >> 8) & 0xff, seq & 0xff);
            let tags = fleet_tags(cfg);
            debug!(instance = %id, %name, %group, "sim: launched");
            state.instances.push(SimInstance {
                id: id.clone(),
                display_name: name.clone(),
                tags,
                ip,
                lifecycle: Lifecycle::Running,
            });
            out.push(Instance {
                id,
                display_name: name,
                lifecycle: Lifecycle::Running,
            });
        }
        Ok(out)
    }

    async fn terminate_instances(&self, ids: &[String]) -> CloudResult<()> {
        let mut state = self.lock();
        for id in ids {
            // Unknown ids count as already terminated.
            if let Some(inst) = state.instances.iter_mut().find(|i| &i.id == id) {
                inst.lifecycle = Lifecycle::Terminated;
                debug!(instance = %id, "sim: terminated");
            }
        }
        Ok(())
    }

    async fn instance_primary_private_ip(
        &self,
        _compartment_id: &str,
        id: &str,
    ) -> CloudResult<String> {
        let state = self.lock();
        state
            .instances
            .iter()
            .find(|i| i.id == id && i.lifecycle != Lifecycle::Terminated)
            .map(|i| i.ip.clone())
            .ok_or_else(|| CloudError::NotFound(format!("instance {id}")))
    }

    async fn ensure_load_balancer(&self, cfg: &FleetConfig) -> CloudResult<LbHandle> {
        let spec = cfg
            .spec
            .load_balancer
            .as_ref()
            .filter(|lb| lb.enabled)
            .ok_or_else(|| CloudError::Failed("load balancer is disabled in config".into()))?;
        if spec.subnet_id.trim().is_empty() {
            return Err(CloudError::Failed("loadBalancer.subnetId must be set".into()));
        }
        let display_name = format!("{}-lb", cfg.metadata.name);
        let mut state = self.lock();
        let next_id = format!("ocid1.loadbalancer.sim..{:08}", state.lbs.len() as u64 + 1);
        let lb = state
            .lbs
            .entry(display_name)
            .or_insert_with(|| SimLb {
                id: next_id,
                backends: BTreeSet::new(),
            });
        Ok(LbHandle {
            id: lb.id.clone(),
            backend_set: "fleet-backendset".to_string(),
            listener: "http-listener".to_string(),
        })
    }

    async fn list_backends(&self, lb_id: &str, _backend_set: &str) -> CloudResult<Vec<Backend>> {
        let state = self.lock();
        let lb = state
            .lbs
            .values()
            .find(|lb| lb.id == lb_id)
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {lb_id}")))?;
        Ok(lb.backends.iter().cloned().collect())
    }

    async fn add_backend(
        &self,
        lb_id: &str,
        _backend_set: &str,
        ip: &str,
        port: u16,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        if state.backend_throttles > 0 {
            state.backend_throttles -= 1;
            return Err(CloudError::Transient("429 too many requests".into()));
        }
        let lb = state
            .lbs
            .values_mut()
            .find(|lb| lb.id == lb_id)
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {lb_id}")))?;
        let backend = Backend {
            ip_address: ip.to_string(),
            port,
        };
        if !lb.backends.insert(backend) {
            return Err(CloudError::AlreadyExists(format!("backend {ip}:{port}")));
        }
        Ok(())
    }

    async fn remove_backend(
        &self,
        lb_id: &str,
        _backend_set: &str,
        ip: &str,
        port: u16,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        if state.backend_throttles > 0 {
            state.backend_throttles -= 1;
            return Err(CloudError::Transient("429 too many requests".into()));
        }
        let lb = state
            .lbs
            .values_mut()
            .find(|lb| lb.id == lb_id)
            .ok_or_else(|| CloudError::NotFound(format!("load balancer {lb_id}")))?;
        let backend = Backend {
            ip_address: ip.to_string(),
            port,
        };
        if !lb.backends.remove(&backend) {
            return Err(CloudError::NotFound(format!("backend {ip}:{port}")));
        }
        Ok(())
    }

    async fn validate_info(&self) -> CloudResult<AuthInfo> {
        Ok(AuthInfo {
            region: "sim-region-1".to_string(),
            tenancy: "ocid1.tenancy.sim..00000001".to_string(),
            user: "ocid1.user.sim..00000001".to_string(),
            regions_count: 1,
            subscribed_regions: vec!["sim-region-1".to_string()],
        })
    }
}
