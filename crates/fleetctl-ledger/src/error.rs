//! Error types for the fleet ledger.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur while reading or writing the ledger document.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("reading ledger file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing ledger file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding ledger: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("writing ledger file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
