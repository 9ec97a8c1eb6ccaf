//! Service-specific error types

use thiserror::Error;

/// Lifecycle errors of the proxy service.
///
/// Per-request failures (upstream timeout, unreachable slot, bad request)
/// become HTTP responses in the proxy handler and never propagate as Rust
/// errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("public IP lookup failed: {0}")]
    PublicIp(String),

    #[error("no pool slot could be started")]
    NoUsableSlots,
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
