//! Service lifecycle state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.
//!
//! Startup clears instances left by a previous run before creating new ones;
//! every path out of the service after bring-up goes through teardown.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// Runtime counters shared by the proxy handler and the health endpoint
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests whose response head has not been produced yet.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// Loading config, installing recorders
    Initializing,
    /// Removing instances from a previous run
    ClearingStale,
    /// Creating instances and registering slots
    BringingUp,
    /// Activation renewals running, listeners binding
    Starting { slots: usize },
    /// Serving requests
    Running { slots: usize },
    /// Listeners closed, waiting for in-flight requests
    Draining { deadline: Instant },
    /// Removing every pool instance
    TearingDown { exit_code: i32 },
    /// Terminal state
    Stopped { exit_code: i32 },
}

#[derive(Debug)]
pub enum ServiceEvent {
    ConfigLoaded,
    StaleCleared,
    /// Bring-up finished with this many registered slots
    PoolUp { slots: usize },
    ListenersReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// Every in-flight request finished
    Drained,
    DrainTimeout,
    TornDown,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ServiceAction {
    ClearStale,
    BringUp,
    /// Spawn activation renewals and bind the listeners
    Activate,
    /// Stop accepting and wait until `deadline`
    Drain { deadline: Instant },
    TearDown,
    Exit { code: i32 },
    None,
}

/// Time in-flight requests get to finish after a shutdown signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Startup ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded) => {
            (ServiceState::ClearingStale, ServiceAction::ClearStale)
        }
        (ServiceState::ClearingStale, ServiceEvent::StaleCleared) => {
            (ServiceState::BringingUp, ServiceAction::BringUp)
        }
        // Nothing to serve through; clean up whatever was half-created.
        (ServiceState::BringingUp, ServiceEvent::PoolUp { slots: 0 }) => (
            ServiceState::TearingDown { exit_code: 1 },
            ServiceAction::TearDown,
        ),
        (ServiceState::BringingUp, ServiceEvent::PoolUp { slots }) => {
            (ServiceState::Starting { slots }, ServiceAction::Activate)
        }
        (ServiceState::Starting { slots }, ServiceEvent::ListenersReady) => {
            (ServiceState::Running { slots }, ServiceAction::None)
        }

        // --- Shutdown ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            (
                ServiceState::Draining { deadline },
                ServiceAction::Drain { deadline },
            )
        }
        (ServiceState::Draining { .. }, ServiceEvent::Drained | ServiceEvent::DrainTimeout) => (
            ServiceState::TearingDown { exit_code: 0 },
            ServiceAction::TearDown,
        ),
        (ServiceState::TearingDown { exit_code }, ServiceEvent::TornDown) => (
            ServiceState::Stopped { exit_code },
            ServiceAction::Exit { code: exit_code },
        ),

        // Signal before any instance exists
        (ServiceState::Initializing, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Exit { code: 0 },
        ),
        // Signal mid-startup: instances may exist
        (
            ServiceState::ClearingStale | ServiceState::BringingUp | ServiceState::Starting { .. },
            ServiceEvent::ShutdownSignal,
        ) => (
            ServiceState::TearingDown { exit_code: 0 },
            ServiceAction::TearDown,
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_sequence() {
        let (state, action) = handle_event(ServiceState::Initializing, ServiceEvent::ConfigLoaded);
        assert_eq!(state, ServiceState::ClearingStale);
        assert_eq!(action, ServiceAction::ClearStale);

        let (state, action) = handle_event(state, ServiceEvent::StaleCleared);
        assert_eq!(state, ServiceState::BringingUp);
        assert_eq!(action, ServiceAction::BringUp);

        let (state, action) = handle_event(state, ServiceEvent::PoolUp { slots: 6 });
        assert_eq!(state, ServiceState::Starting { slots: 6 });
        assert_eq!(action, ServiceAction::Activate);

        let (state, action) = handle_event(state, ServiceEvent::ListenersReady);
        assert_eq!(state, ServiceState::Running { slots: 6 });
        assert_eq!(action, ServiceAction::None);
    }

    #[test]
    fn empty_pool_tears_down_and_fails() {
        let (state, action) = handle_event(ServiceState::BringingUp, ServiceEvent::PoolUp { slots: 0 });
        assert_eq!(state, ServiceState::TearingDown { exit_code: 1 });
        assert_eq!(action, ServiceAction::TearDown);

        let (state, action) = handle_event(state, ServiceEvent::TornDown);
        assert_eq!(state, ServiceState::Stopped { exit_code: 1 });
        assert_eq!(action, ServiceAction::Exit { code: 1 });
    }

    #[test]
    fn running_drains_then_tears_down() {
        let before = Instant::now();
        let (state, action) =
            handle_event(ServiceState::Running { slots: 2 }, ServiceEvent::ShutdownSignal);
        let ServiceAction::Drain { deadline } = action else {
            panic!("expected Drain, got {action:?}");
        };
        assert!(deadline >= before + DRAIN_TIMEOUT);
        assert_eq!(state, ServiceState::Draining { deadline });

        let (state, action) = handle_event(state, ServiceEvent::Drained);
        assert_eq!(state, ServiceState::TearingDown { exit_code: 0 });
        assert_eq!(action, ServiceAction::TearDown);
    }

    #[test]
    fn drain_timeout_still_tears_down() {
        let (state, action) = handle_event(
            ServiceState::Draining {
                deadline: Instant::now(),
            },
            ServiceEvent::DrainTimeout,
        );
        assert_eq!(state, ServiceState::TearingDown { exit_code: 0 });
        assert_eq!(action, ServiceAction::TearDown);
    }

    #[test]
    fn signal_during_startup_tears_down() {
        for state in [
            ServiceState::ClearingStale,
            ServiceState::BringingUp,
            ServiceState::Starting { slots: 1 },
        ] {
            let (state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
            assert_eq!(state, ServiceState::TearingDown { exit_code: 0 });
            assert_eq!(action, ServiceAction::TearDown);
        }
    }

    #[test]
    fn signal_before_startup_exits_directly() {
        let (state, action) = handle_event(ServiceState::Initializing, ServiceEvent::ShutdownSignal);
        assert_eq!(state, ServiceState::Stopped { exit_code: 0 });
        assert_eq!(action, ServiceAction::Exit { code: 0 });
    }

    #[test]
    fn unrelated_events_leave_state_unchanged() {
        let (state, action) = handle_event(ServiceState::Running { slots: 3 }, ServiceEvent::TornDown);
        assert_eq!(state, ServiceState::Running { slots: 3 });
        assert_eq!(action, ServiceAction::None);

        let (state, _) = handle_event(ServiceState::Stopped { exit_code: 0 }, ServiceEvent::ShutdownSignal);
        assert_eq!(state, ServiceState::Stopped { exit_code: 0 });
    }

    #[test]
    fn service_metrics_start_at_zero() {
        let metrics = ServiceMetrics::new();
        assert_eq!(
            metrics
                .in_flight
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }
}
