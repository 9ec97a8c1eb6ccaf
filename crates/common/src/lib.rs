//! Shared types for the VPN egress proxy workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
