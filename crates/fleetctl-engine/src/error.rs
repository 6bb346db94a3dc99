//! Engine error types.
//!
//! Errors carry the operation context they originated from; the CLI maps
//! cloud-rooted failures to a distinct exit code.

use fleetctl_cloud::CloudError;
use fleetctl_ledger::LedgerError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("list fleet instances: {0}")]
    List(#[source] CloudError),

    #[error("launch instances: {0}")]
    Launch(#[source] CloudError),

    #[error("terminate instance {id}: {source}")]
    Terminate {
        id: String,
        #[source]
        source: CloudError,
    },

    #[error("launch replacement for {id}: {source}")]
    Replace {
        id: String,
        #[source]
        source: CloudError,
    },

    #[error("ensure load balancer: {0}")]
    EnsureLb(#[source] CloudError),

    #[error("list backends: {0}")]
    ListBackends(#[source] CloudError),

    /// Scale verification did not converge before the deadline. The next
    /// control-loop tick will reattempt.
    #[error("scale verify timeout: actual={actual} desired={desired}")]
    VerifyTimeout { actual: usize, desired: usize },
}

impl EngineError {
    /// Whether the failure originated in the cloud (as opposed to local
    /// state). Drives the CLI exit-code mapping.
    pub fn is_cloud(&self) -> bool {
        !matches!(self, EngineError::Ledger(_))
    }
}
