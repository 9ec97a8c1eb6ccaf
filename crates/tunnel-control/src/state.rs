//! Controller state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The controller executes the process I/O implied by each action.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──established──▶ Connected
//!  ▲                      │                          │
//!  │        failed/timeout│/disconnect               │ disconnect
//!  │                      ▼                          │
//!  └────── exited ──── Disconnecting ◀───────────────┘
//! ```

use crate::error::ControlError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TunnelState {
    #[default]
    Idle,
    /// Tunnel process spawned, waiting for the establishment marker
    Connecting,
    Connected {
        egress: String,
    },
    /// Termination signal sent, waiting for the process to exit
    Disconnecting,
}

impl TunnelState {
    pub fn label(&self) -> &'static str {
        match self {
            TunnelState::Idle => "idle",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected { .. } => "connected",
            TunnelState::Disconnecting => "disconnecting",
        }
    }
}

#[derive(Debug)]
pub enum TunnelEvent {
    ConnectRequested,
    /// Establishment marker seen on stdout
    Established { egress: String },
    /// Stderr output, early exit, or timeout while connecting
    ConnectFailed,
    DisconnectRequested,
    /// The tunnel process exited
    Exited,
}

#[derive(Debug)]
pub enum TunnelAction {
    Spawn,
    /// Send the termination signal to the running process
    Kill,
    Reject(ControlError),
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: TunnelState, event: TunnelEvent) -> (TunnelState, TunnelAction) {
    match (state, event) {
        // --- connect ---
        (TunnelState::Idle, TunnelEvent::ConnectRequested) => {
            (TunnelState::Connecting, TunnelAction::Spawn)
        }
        (state, TunnelEvent::ConnectRequested) => {
            (state, TunnelAction::Reject(ControlError::AlreadyConnected))
        }

        // --- Connecting ---
        (TunnelState::Connecting, TunnelEvent::Established { egress }) => {
            (TunnelState::Connected { egress }, TunnelAction::None)
        }
        (TunnelState::Connecting, TunnelEvent::ConnectFailed) => {
            (TunnelState::Disconnecting, TunnelAction::Kill)
        }

        // --- disconnect ---
        (
            TunnelState::Connecting | TunnelState::Connected { .. },
            TunnelEvent::DisconnectRequested,
        ) => (TunnelState::Disconnecting, TunnelAction::Kill),
        (state, TunnelEvent::DisconnectRequested) => {
            (state, TunnelAction::Reject(ControlError::NotConnected))
        }

        // --- process gone ---
        (_, TunnelEvent::Exited) => (TunnelState::Idle, TunnelAction::None),

        // --- Stale establishment/failure after a disconnect: stay put ---
        (state, _event) => (state, TunnelAction::None),
    }
}
