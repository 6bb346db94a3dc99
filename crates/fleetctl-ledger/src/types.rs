//! Domain types persisted in the ledger document.
//!
//! The on-disk format is a single JSON object keyed by fleet name; all
//! timestamps are RFC 3339. The document is this controller's own history
//! of launches and terminations, not an authoritative inventory.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Active,
    Terminated,
}

/// A single instance this controller has launched (or inherited via sync).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    pub group: String,
    pub name: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cached snapshot of the last reconciled load-balancer state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LbInfo {
    pub enabled: bool,
    pub id: String,
    pub backend_set: String,
    pub listener: String,
    #[serde(default)]
    pub backends: Vec<String>,
    pub backends_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// All records tracked for one named fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetLedger {
    #[serde(default)]
    pub fleet_name: String,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb: Option<LbInfo>,
}

impl FleetLedger {
    /// Number of records currently marked Active.
    pub fn count_active(&self) -> usize {
        self.instances
            .iter()
            .filter(|r| r.status == InstanceStatus::Active)
            .count()
    }
}

/// Top-level document: one ledger per fleet name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Root {
    #[serde(default)]
    pub fleets: BTreeMap<String, FleetLedger>,
}
