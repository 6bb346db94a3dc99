//! fleetctl-engine — the reconciliation engine.
//!
//! The engine drives live cloud state toward a declared fleet: it scales
//! up and down with bounded-concurrency worker pools, performs serial
//! in-place replacement, rebuilds the ledger from the cloud, and keeps a
//! load-balancer backend set aligned with the live instance set. A single
//! per-fleet mutex serializes every mutating operation.
//!
//! # Components
//!
//! - **`engine`** — `Engine`: scale, state sync, verification, status
//! - **`restart`** — serial rolling restart
//! - **`lb`** — load-balancer reconciliation and backend bookkeeping
//! - **`control`** — the periodic control loop and its published snapshot

mod control;
mod engine;
mod error;
mod lb;
mod restart;

pub use control::{ControlLoop, ControlSnapshot, ControlState};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
