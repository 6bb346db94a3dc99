//! fleetctl-ledger — durable, crash-safe record of the instances this
//! controller owns, plus a cached load-balancer snapshot per fleet.
//!
//! The ledger is the controller's memory, not an inventory of the cloud:
//! it backs the control loop's lower-bound policy and group selection, and
//! is rebuilt from the cloud by state sync when they drift.

mod error;
mod store;
mod types;

pub use error::{LedgerError, LedgerResult};
pub use store::Ledger;
pub use types::{FleetLedger, InstanceRecord, InstanceStatus, LbInfo};
