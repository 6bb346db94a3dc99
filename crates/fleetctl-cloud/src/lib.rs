//! fleetctl-cloud — the seam between the reconciliation engine and the
//! compute service.
//!
//! # Components
//!
//! - **`provider`** — the [`CloudProvider`] trait and its wire types
//! - **`error`** — transient / terminal / idempotent error taxonomy
//! - **`retry`** — capped exponential backoff for backend mutations
//! - **`sim`** — in-process simulated backend for development and tests

mod error;
mod provider;
pub mod retry;
mod sim;

pub use error::{is_transient_message, CloudError, CloudResult};
pub use provider::{
    fleet_tags, AuthInfo, Backend, CloudProvider, Instance, LbHandle, Lifecycle, FLEET_TAG_KEY,
};
pub use sim::SimCloud;
