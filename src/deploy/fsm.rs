//! Finite state machine for deployment lifecycle

use serde::{Deserialize, Serialize};

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Accepted, not yet building
    Pending,

    /// Driver build in progress
    Building,

    /// Launched, awaiting the first healthy probe
    Starting,

    /// Started and probed healthy
    Running,

    /// Stop requested, waiting for driver acknowledgement
    Stopping,

    /// Stopped by explicit request
    Stopped,

    /// Probe reported non-running while the instance should be up
    Crashed,

    /// Unrecoverable driver error; final for this attempt
    Failed,
}

impl DeploymentState {
    /// States occupying the (project, environment, port) slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeploymentState::Building
                | DeploymentState::Starting
                | DeploymentState::Running
                | DeploymentState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Stopped | DeploymentState::Crashed | DeploymentState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Building => "building",
            DeploymentState::Starting => "starting",
            DeploymentState::Running => "running",
            DeploymentState::Stopping => "stopping",
            DeploymentState::Stopped => "stopped",
            DeploymentState::Crashed => "crashed",
            DeploymentState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Begin the build phase
    Accept,

    /// Driver build succeeded
    BuildOk,

    /// Driver build failed; final for this attempt
    BuildFailed(String),

    /// Driver start succeeded and the first probe was healthy
    StartOk,

    /// Driver start failed; final for this attempt
    StartFailed(String),

    /// Probe reported non-running or timed out
    Crash(String),

    /// Explicit stop request
    StopRequested,

    /// Driver acknowledged stop (or the grace period elapsed)
    StopComplete,

    /// Restart request on a stopped or crashed instance
    Restart,

    /// Unrecoverable driver error outside build/start
    Fail(String),
}

/// Outcome of processing a lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// State changed
    Changed {
        from: DeploymentState,
        to: DeploymentState,
    },

    /// Request was valid but required no transition (e.g. stop on stopped)
    Noop(String),
}

/// Per-instance lifecycle state machine.
///
/// Single-writer: only the orchestrator task handling an instance may call
/// `process`. Operator requests that do not apply to the current state are
/// reported as informational no-ops, never as errors; events that can only
/// come from a programming error are rejected.
#[derive(Debug, Clone)]
pub struct LifecycleFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl LifecycleFsm {
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Pending,
            error: None,
        }
    }

    /// Rehydrate the machine for an instance whose state lives in the
    /// registry
    pub fn from_state(state: DeploymentState) -> Self {
        Self { state, error: None }
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: LifecycleEvent) -> Result<Transition, String> {
        use DeploymentState as S;
        use LifecycleEvent as E;

        let from = self.state;
        let to = match (&self.state, &event) {
            (S::Pending, E::Accept) => {
                self.error = None;
                S::Building
            }

            (S::Building, E::BuildOk) => S::Starting,
            (S::Building, E::BuildFailed(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }

            (S::Starting, E::StartOk) => S::Running,
            (S::Starting, E::StartFailed(err)) => {
                self.error = Some(err.clone());
                S::Failed
            }
            (S::Starting, E::Crash(err)) => {
                self.error = Some(err.clone());
                S::Crashed
            }

            (S::Running, E::Crash(err)) => {
                self.error = Some(err.clone());
                S::Crashed
            }

            // Stop is honored from any in-flight state; for building and
            // starting the orchestrator issues this only after the in-flight
            // driver call has returned.
            (S::Running | S::Building | S::Starting, E::StopRequested) => S::Stopping,
            (S::Stopping, E::StopComplete) => S::Stopped,

            // Stop on something not running is informational, not an error
            (S::Pending | S::Stopped | S::Crashed | S::Failed, E::StopRequested) => {
                return Ok(Transition::Noop(format!(
                    "Already {}, nothing to stop",
                    self.state
                )));
            }
            (S::Stopping, E::StopRequested) => {
                return Ok(Transition::Noop("Stop already in progress".to_string()));
            }

            (S::Stopped | S::Crashed, E::Restart) => {
                self.error = None;
                S::Starting
            }

            (state, E::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                S::Failed
            }

            (state, event) => {
                return Err(format!("Invalid transition: {} -> {:?}", state, event));
            }
        };

        self.state = to;
        Ok(Transition::Changed { from, to })
    }
}

impl Default for LifecycleFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(t: Transition) -> DeploymentState {
        match t {
            Transition::Changed { to, .. } => to,
            Transition::Noop(msg) => panic!("expected transition, got noop: {}", msg),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut fsm = LifecycleFsm::new();
        assert_eq!(fsm.state(), DeploymentState::Pending);

        assert_eq!(changed(fsm.process(LifecycleEvent::Accept).unwrap()), DeploymentState::Building);
        assert_eq!(changed(fsm.process(LifecycleEvent::BuildOk).unwrap()), DeploymentState::Starting);
        assert_eq!(changed(fsm.process(LifecycleEvent::StartOk).unwrap()), DeploymentState::Running);
        assert_eq!(changed(fsm.process(LifecycleEvent::StopRequested).unwrap()), DeploymentState::Stopping);
        assert_eq!(changed(fsm.process(LifecycleEvent::StopComplete).unwrap()), DeploymentState::Stopped);
    }

    #[test]
    fn test_build_failure_is_final() {
        let mut fsm = LifecycleFsm::new();
        fsm.process(LifecycleEvent::Accept).unwrap();
        fsm.process(LifecycleEvent::BuildFailed("npm exited with 1".to_string()))
            .unwrap();

        assert_eq!(fsm.state(), DeploymentState::Failed);
        assert_eq!(fsm.error(), Some("npm exited with 1"));

        // A failed build never reaches starting
        assert!(fsm.process(LifecycleEvent::BuildOk).is_err());
        assert!(fsm.process(LifecycleEvent::Restart).is_err());
    }

    #[test]
    fn test_start_launched_but_unhealthy_crashes() {
        let mut fsm = LifecycleFsm::new();
        fsm.process(LifecycleEvent::Accept).unwrap();
        fsm.process(LifecycleEvent::BuildOk).unwrap();
        fsm.process(LifecycleEvent::Crash("first probe reported stopped".to_string()))
            .unwrap();

        assert_eq!(fsm.state(), DeploymentState::Crashed);
    }

    #[test]
    fn test_restart_from_stopped_and_crashed() {
        let mut fsm = LifecycleFsm::new();
        fsm.process(LifecycleEvent::Accept).unwrap();
        fsm.process(LifecycleEvent::BuildOk).unwrap();
        fsm.process(LifecycleEvent::StartOk).unwrap();
        fsm.process(LifecycleEvent::StopRequested).unwrap();
        fsm.process(LifecycleEvent::StopComplete).unwrap();

        assert_eq!(changed(fsm.process(LifecycleEvent::Restart).unwrap()), DeploymentState::Starting);
        fsm.process(LifecycleEvent::Crash("probe timeout".to_string())).unwrap();
        assert_eq!(changed(fsm.process(LifecycleEvent::Restart).unwrap()), DeploymentState::Starting);
    }

    #[test]
    fn test_stop_on_stopped_is_noop() {
        let mut fsm = LifecycleFsm::new();
        fsm.process(LifecycleEvent::Accept).unwrap();
        fsm.process(LifecycleEvent::BuildOk).unwrap();
        fsm.process(LifecycleEvent::StartOk).unwrap();
        fsm.process(LifecycleEvent::StopRequested).unwrap();
        fsm.process(LifecycleEvent::StopComplete).unwrap();

        match fsm.process(LifecycleEvent::StopRequested).unwrap() {
            Transition::Noop(msg) => assert!(msg.contains("stopped")),
            other => panic!("expected noop, got {:?}", other),
        }
        assert_eq!(fsm.state(), DeploymentState::Stopped);
    }

    #[test]
    fn test_stop_during_build_transitions_to_stopping() {
        let mut fsm = LifecycleFsm::new();
        fsm.process(LifecycleEvent::Accept).unwrap();

        assert_eq!(changed(fsm.process(LifecycleEvent::StopRequested).unwrap()), DeploymentState::Stopping);
        assert_eq!(changed(fsm.process(LifecycleEvent::StopComplete).unwrap()), DeploymentState::Stopped);
    }

    #[test]
    fn test_no_restart_from_running() {
        let mut fsm = LifecycleFsm::new();
        fsm.process(LifecycleEvent::Accept).unwrap();
        fsm.process(LifecycleEvent::BuildOk).unwrap();
        fsm.process(LifecycleEvent::StartOk).unwrap();

        assert!(fsm.process(LifecycleEvent::Restart).is_err());
    }

    #[test]
    fn test_fail_from_terminal_rejected() {
        let mut fsm = LifecycleFsm::new();
        fsm.process(LifecycleEvent::Accept).unwrap();
        fsm.process(LifecycleEvent::BuildFailed("x".to_string())).unwrap();

        assert!(fsm.process(LifecycleEvent::Fail("y".to_string())).is_err());
    }
}
