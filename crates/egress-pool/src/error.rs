//! Error types for pool operations

use std::path::PathBuf;

use tunnel_control::ControlError;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tunnel directory for vendor {vendor} not found: {}", path.display())]
    CatalogNotFound { vendor: String, path: PathBuf },

    #[error("failed to read tunnel directory {}: {source}", path.display())]
    CatalogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no tunnel files for vendor {0}")]
    EmptyCatalog(String),

    #[error("instance {op} failed: {detail}")]
    InstanceLifecycle { op: &'static str, detail: String },

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("slot not found: {0}")]
    SlotNotFound(String),

    #[error("renewal already in progress for slot {0}")]
    RenewalInProgress(String),

    #[error("renewal of slot {key} gave up after {attempts} attempts: {last_error}")]
    RenewalExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("port allocation failed: {0}")]
    PortRange(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
