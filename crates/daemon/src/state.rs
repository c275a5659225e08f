use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::controller::DaemonHandler;
use crate::error::{ControlError, Result};

/// Lifecycle state of the supervised daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonState {
    Pending,
    Offline,
    Online,
    Suspended,
    Error,
    Unknown,
}

impl DaemonState {
    pub fn name(self) -> &'static str {
        match self {
            DaemonState::Pending => "PENDING",
            DaemonState::Offline => "OFFLINE",
            DaemonState::Online => "ONLINE",
            DaemonState::Suspended => "SUSPENDED",
            DaemonState::Error => "ERROR",
            DaemonState::Unknown => "UNKNOWN",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// OFFLINE, ERROR and UNKNOWN only leave through PENDING, which is what an
    /// explicit start or restart produces. ONLINE and SUSPENDED may also drop
    /// back to PENDING when the daemon is restarted into another run level.
    pub fn can_transition_to(self, next: DaemonState) -> bool {
        use DaemonState::*;

        matches!(
            (self, next),
            (Pending, Online)
                | (Pending, Error)
                | (Pending, Offline)
                | (Online, Offline)
                | (Online, Suspended)
                | (Online, Error)
                | (Online, Pending)
                | (Suspended, Online)
                | (Suspended, Offline)
                | (Suspended, Pending)
                | (Offline, Pending)
                | (Error, Pending)
                | (Unknown, Pending)
        )
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Single-writer holder of the authoritative [`DaemonState`].
///
/// Controller implementations own one of these and call [`StateMachine::transition`]
/// whenever the daemon moves; the registered handler is invoked with the new state
/// after the write lock has been released, so handlers may query the state again.
pub struct StateMachine {
    state: RwLock<DaemonState>,
    handler: RwLock<Option<Arc<dyn DaemonHandler>>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::with_state(DaemonState::Offline)
    }

    pub fn with_state(initial: DaemonState) -> Self {
        Self {
            state: RwLock::new(initial),
            handler: RwLock::new(None),
        }
    }

    pub fn current(&self) -> DaemonState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_handler(&self, handler: Arc<dyn DaemonHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn handler(&self) -> Option<Arc<dyn DaemonHandler>> {
        self.handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Move to `next`, returning `Ok(false)` when already there.
    pub fn transition(&self, next: DaemonState) -> Result<bool> {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let from = *state;
            if from == next {
                debug!("Ignoring same-state transition to {}", next);
                return Ok(false);
            }
            if !from.can_transition_to(next) {
                warn!("Rejected daemon state transition {} -> {}", from, next);
                return Err(ControlError::InvalidTransition { from, to: next });
            }
            *state = next;
            debug!("Daemon state {} -> {}", from, next);
        }

        if let Some(handler) = self.handler() {
            handler.on_state_changed(next);
        }
        Ok(true)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::DaemonEvent;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<DaemonState>>,
    }

    impl DaemonHandler for Recorder {
        fn on_state_changed(&self, state: DaemonState) {
            self.states.lock().unwrap().push(state);
        }

        fn on_neighborhood_changed(&self) {}

        fn on_event(&self, _event: DaemonEvent) {}
    }

    #[test]
    fn test_initial_state_is_offline() {
        assert_eq!(StateMachine::new().current(), DaemonState::Offline);
    }

    #[test]
    fn test_absorbing_states_only_leave_through_pending() {
        for from in [DaemonState::Offline, DaemonState::Error, DaemonState::Unknown] {
            assert!(from.can_transition_to(DaemonState::Pending));
            assert!(!from.can_transition_to(DaemonState::Online));
            assert!(!from.can_transition_to(DaemonState::Suspended));
        }
    }

    #[test]
    fn test_suspended_cannot_error() {
        assert!(!DaemonState::Suspended.can_transition_to(DaemonState::Error));
    }

    #[test]
    fn test_transition_notifies_handler_in_order() {
        let machine = StateMachine::new();
        let recorder = Arc::new(Recorder::default());
        machine.set_handler(recorder.clone());

        machine.transition(DaemonState::Pending).unwrap();
        machine.transition(DaemonState::Online).unwrap();
        machine.transition(DaemonState::Offline).unwrap();

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![DaemonState::Pending, DaemonState::Online, DaemonState::Offline]
        );
    }

    #[test]
    fn test_invalid_transition_is_rejected_without_notification() {
        let machine = StateMachine::new();
        let recorder = Arc::new(Recorder::default());
        machine.set_handler(recorder.clone());

        let result = machine.transition(DaemonState::Online);
        assert!(matches!(
            result,
            Err(ControlError::InvalidTransition {
                from: DaemonState::Offline,
                to: DaemonState::Online
            })
        ));
        assert_eq!(machine.current(), DaemonState::Offline);
        assert!(recorder.states.lock().unwrap().is_empty());
    }

    #[test]
    fn test_same_state_is_ignored() {
        let machine = StateMachine::new();
        assert!(!machine.transition(DaemonState::Offline).unwrap());
    }

    #[test]
    fn test_state_serializes_as_upper_case_name() {
        let json = serde_json::to_string(&DaemonState::Suspended).unwrap();
        assert_eq!(json, "\"SUSPENDED\"");
        assert_eq!(DaemonState::Online.to_string(), "ONLINE");
    }
}
