use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::EventBus;

/// Topic carrying one console line per event, without a line terminator.
pub const CONSOLE_OUTPUT_EVENT: &str = "console output";
/// Topic carrying the new state name on every transition.
pub const STATE_CHANGE_EVENT: &str = "state change";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Offline,
    Starting,
    Running,
    Stopping,
}

impl ProcessState {
    /// The transition table for a server process. Recovery edges to Offline
    /// exist for abnormal exits out of Running and Starting.
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;

        matches!(
            (self, next),
            (Offline, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Offline)
                | (Running, Stopping)
                | (Running, Offline)
                | (Stopping, Offline)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Offline => "offline",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
        };

        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StateTransition {
    pub previous: ProcessState,
    pub current: ProcessState,
}

/// Holds the current process state for one server. Shared between the server
/// and its environment so that stream teardown and power actions can both
/// move the state; every mutation goes through [`StateStore::set`].
pub struct StateStore {
    state: Mutex<ProcessState>,
    events: Arc<EventBus>,
    transitions: mpsc::UnboundedSender<StateTransition>,
}

impl StateStore {
    pub fn new(events: Arc<EventBus>) -> (Arc<Self>, mpsc::UnboundedReceiver<StateTransition>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let store = Arc::new(Self {
            state: Mutex::new(ProcessState::Offline),
            events,
            transitions: tx,
        });

        (store, rx)
    }

    pub fn get(&self) -> ProcessState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Moves the state machine. Setting the current state again is a no-op
    /// and emits nothing.
    pub fn set(&self, next: ProcessState) {
        let previous = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == next {
                return;
            }

            let previous = *state;
            *state = next;
            previous
        };

        if !previous.can_transition_to(next) {
            warn!(%previous, state = %next, "unexpected process state transition");
        }

        debug!(%previous, state = %next, "updated process state");
        self.events.publish(STATE_CHANGE_EVENT, next.to_string());
        let _ = self.transitions.send(StateTransition { previous, current: next });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessState::*;

    #[test]
    fn transition_table() {
        assert!(Offline.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Stopping));
        assert!(Starting.can_transition_to(Offline));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Offline));
        assert!(Stopping.can_transition_to(Offline));

        assert!(!Offline.can_transition_to(Running));
        assert!(!Offline.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Starting));
    }

    #[test]
    fn state_names() {
        assert_eq!(Offline.to_string(), "offline");
        assert_eq!(Starting.to_string(), "starting");
        assert_eq!(Running.to_string(), "running");
        assert_eq!(Stopping.to_string(), "stopping");
    }

    #[tokio::test]
    async fn set_publishes_transitions_and_ignores_same_state() {
        let events = Arc::new(EventBus::new());
        let mut sub = events.subscribe(STATE_CHANGE_EVENT).unwrap();
        let (store, mut rx) = StateStore::new(events.clone());

        assert_eq!(store.get(), Offline);

        store.set(Starting);
        store.set(Starting);
        store.set(Running);

        assert_eq!(sub.recv().await.unwrap(), "starting");
        assert_eq!(sub.recv().await.unwrap(), "running");

        let t = rx.recv().await.unwrap();
        assert_eq!(t.previous, Offline);
        assert_eq!(t.current, Starting);
        let t = rx.recv().await.unwrap();
        assert_eq!(t.previous, Starting);
        assert_eq!(t.current, Running);
    }
}
