//! The engine-facing cloud interface.
//!
//! Everything the reconciliation engine knows about the cloud goes through
//! [`CloudProvider`]. Instances are discovered by the freeform tag
//! `fleetctl-fleet = <fleetName>`; launch and terminate calls block until
//! the instance reaches its target lifecycle state.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleetctl_config::FleetConfig;

use crate::error::CloudResult;

/// Freeform tag key marking instances as members of a fleet.
pub const FLEET_TAG_KEY: &str = "fleetctl-fleet";

/// Instance lifecycle states the controller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lifecycle {
    Provisioning,
    Running,
    Terminating,
    Terminated,
}

/// Minimal view of a compute instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub display_name: String,
    pub lifecycle: Lifecycle,
}

/// Identity details discovered during auth validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    pub region: String,
    pub tenancy: String,
    pub user: String,
    pub regions_count: usize,
    pub subscribed_regions: Vec<String>,
}

/// Identifiers of an ensured load balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LbHandle {
    pub id: String,
    pub backend_set: String,
    pub listener: String,
}

/// One registered backend of a backend set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub ip_address: String,
    pub port: u16,
}

/// Cloud adapter consumed by the engine. Implementations are stateless
/// from the engine's point of view and safe to share across tasks.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Non-terminated instances carrying the fleet tag.
    async fn list_instances_by_fleet(
        &self,
        compartment_id: &str,
        fleet: &str,
    ) -> CloudResult<Vec<Instance>>;

    /// Launch `n` instances into `group`, tagged for the fleet, and wait
    /// until each is running.
    async fn launch_instances(
        &self,
        cfg: &FleetConfig,
        group: &str,
        n: usize,
    ) -> CloudResult<Vec<Instance>>;

    /// Terminate the given instances and wait until each is terminated.
    /// An instance that is already gone counts as success.
    async fn terminate_instances(&self, ids: &[String]) -> CloudResult<()>;

    /// Primary private IP of an instance's first VNIC.
    async fn instance_primary_private_ip(
        &self,
        compartment_id: &str,
        id: &str,
    ) -> CloudResult<String>;

    /// Find or create the fleet's load balancer, backend set, and listener.
    async fn ensure_load_balancer(&self, cfg: &FleetConfig) -> CloudResult<LbHandle>;

    /// Current backends of a backend set.
    async fn list_backends(&self, lb_id: &str, backend_set: &str) -> CloudResult<Vec<Backend>>;

    /// Register `ip:port` as a backend. Surfaces `AlreadyExists` when the
    /// backend is present; callers treat that as success.
    async fn add_backend(
        &self,
        lb_id: &str,
        backend_set: &str,
        ip: &str,
        port: u16,
    ) -> CloudResult<()>;

    /// Deregister `ip:port`. Surfaces `NotFound` when the backend is
    /// absent; callers treat that as success.
    async fn remove_backend(
        &self,
        lb_id: &str,
        backend_set: &str,
        ip: &str,
        port: u16,
    ) -> CloudResult<()>;

    /// Backend count of a backend set.
    async fn count_backends(&self, lb_id: &str, backend_set: &str) -> CloudResult<usize> {
        Ok(self.list_backends(lb_id, backend_set).await?.len())
    }

    /// Lightweight identity check.
    async fn validate_info(&self) -> CloudResult<AuthInfo>;
}

/// Merge user-supplied freeform tags with the fleet tag. The fleet tag
/// always wins; it is the sole discovery mechanism.
pub fn fleet_tags(cfg: &FleetConfig) -> HashMap<String, String> {
    let mut tags = cfg.spec.freeform_tags.clone();
    tags.insert(FLEET_TAG_KEY.to_string(), cfg.metadata.name.clone());
    tags
}
