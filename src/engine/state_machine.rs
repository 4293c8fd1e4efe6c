/// `state_machine.rs` — engine supervision
///
/// A small explicit machine: IDLE → STARTING → RUNNING → STOPPING → IDLE,
/// with ERROR reachable from STARTING. The machine itself only decides; the
/// StationEngine executes the returned action (start or stop the resource
/// set) and reports the outcome back as an event.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineContext {
    pub error: Option<String>,
    pub started_resources: Vec<String>,
    pub forced_stop: bool,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Start,
    Stop,
    RadioDisconnected(String),
    /// Resource start finished.
    StartSucceeded { started: Vec<String> },
    StartFailed { error: String, started: Vec<String> },
    /// Resource stop finished.
    StopFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    StartResources,
    StopResources,
}

pub struct EngineStateMachine {
    state: EngineState,
    context: EngineContext,
}

impl Default for EngineStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStateMachine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Idle,
            context: EngineContext::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Apply one event; the caller performs the returned action.
    pub fn on_event(&mut self, event: EngineEvent) -> Option<EngineAction> {
        use EngineState::*;
        let (next, action) = match (self.state, &event) {
            (Idle, EngineEvent::Start) => {
                self.context = EngineContext::default();
                (Starting, Some(EngineAction::StartResources))
            }
            (Starting, EngineEvent::StartSucceeded { started }) => {
                self.context.started_resources = started.clone();
                (Running, None)
            }
            (Starting, EngineEvent::StartFailed { error, started }) => {
                self.context.error = Some(error.clone());
                self.context.started_resources = started.clone();
                (Error, None)
            }
            (Running, EngineEvent::Stop) => (Stopping, Some(EngineAction::StopResources)),
            (Running, EngineEvent::RadioDisconnected(reason)) => {
                self.context.forced_stop = true;
                self.context.error = Some(reason.clone());
                (Stopping, Some(EngineAction::StopResources))
            }
            (Error, EngineEvent::Stop) => (Stopping, Some(EngineAction::StopResources)),
            (Stopping, EngineEvent::StopFinished) => {
                self.context.started_resources.clear();
                (Idle, None)
            }
            (state, event) => {
                log::debug!("engine event {event:?} ignored in state {state:?}");
                (state, None)
            }
        };
        if next != self.state {
            log::info!("engine state: {:?} -> {next:?}", self.state);
            self.state = next;
        }
        action
    }
}
