//! Control-channel errors

use crate::protocol::{Fault, FaultKind};

/// Errors from control-channel calls, client or controller side.
///
/// The first group mirrors controller faults that cross the wire; the second
/// group only ever originates in the client.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("tunnel already connected, disconnect first")]
    AlreadyConnected,

    #[error("tunnel not connected")]
    NotConnected,

    #[error("tunnel not established within {secs}s")]
    ConnectTimeout { secs: u64 },

    #[error("tunnel process failed: {0}")]
    Tunnel(String),

    #[error("failed to spawn tunnel process: {0}")]
    Spawn(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("controller error: {0}")]
    Internal(String),

    #[error("control transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("control call timed out")]
    CallTimeout,

    #[error("control connection closed by peer")]
    ConnectionClosed,

    #[error("control protocol violation: {0}")]
    Protocol(String),
}

impl ControlError {
    /// Wire representation of a controller-side error.
    pub fn to_fault(&self) -> Fault {
        let kind = match self {
            ControlError::AlreadyConnected => FaultKind::AlreadyConnected,
            ControlError::NotConnected => FaultKind::NotConnected,
            ControlError::ConnectTimeout { .. } => FaultKind::Timeout,
            ControlError::Tunnel(_) => FaultKind::Tunnel,
            ControlError::Spawn(_) => FaultKind::Spawn,
            ControlError::InvalidRequest(_) => FaultKind::InvalidRequest,
            _ => FaultKind::Internal,
        };
        let message = match self {
            ControlError::Tunnel(detail)
            | ControlError::Spawn(detail)
            | ControlError::InvalidRequest(detail)
            | ControlError::Internal(detail) => detail.clone(),
            other => other.to_string(),
        };
        Fault {
            kind,
            message,
            timeout_secs: match self {
                ControlError::ConnectTimeout { secs } => Some(*secs),
                _ => None,
            },
        }
    }

    /// Rebuild the typed error from a fault received over the wire.
    pub fn from_fault(fault: Fault) -> Self {
        match fault.kind {
            FaultKind::AlreadyConnected => ControlError::AlreadyConnected,
            FaultKind::NotConnected => ControlError::NotConnected,
            FaultKind::Timeout => ControlError::ConnectTimeout {
                secs: fault.timeout_secs.unwrap_or_default(),
            },
            FaultKind::Tunnel => ControlError::Tunnel(fault.message),
            FaultKind::Spawn => ControlError::Spawn(fault.message),
            FaultKind::InvalidRequest => ControlError::InvalidRequest(fault.message),
            FaultKind::Internal => ControlError::Internal(fault.message),
        }
    }
}

/// Result alias for control-channel operations.
pub type Result<T> = std::result::Result<T, ControlError>;
