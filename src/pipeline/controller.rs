//! # Pipeline Controller
//!
//! Drives one step to completion. Each cycle the step's control box looks at
//! the controller state and picks the next action:
//!
//! ```text
//!                      ┌──────────────── not started
//!                      ▼
//!                   running
//!                      │
//!        ┌─────────────┼──────────────────────────────┐
//!        ▼             │                              ▼
//!  waiting on     ◄────┘                        waiting on remote
//!  computation                                 (decentralized only)
//!        │                                            │
//!        ▼                                            ▼
//!  finished iteration  ────── remote ──────►  finished remote iteration
//!        ▲                                            │
//!        └────────────── next iteration ◄─────────────┘
//!
//!  success ─► [aggregator: final remote transmit] ─► stopped
//! ```
//!
//! The loop is explicit; cancellation is checked at every cycle and
//! interrupts a pending computation or remote exchange.

use super::computation::Computation;
use super::remote::{RemoteExchange, RemoteHandler, RemoteRequest, StepOutput};
use super::spec::ControllerType;
use super::PipelineEvent;
use crate::config::OperatingMode;
use crate::constants::{CONTAINER_CACHE_DIR, CONTAINER_INPUT_DIR, CONTAINER_OUTPUT_DIR};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// State
// =============================================================================

/// Controller lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerStatus {
    /// Created, not started.
    #[default]
    NotStarted,
    /// Loop entered.
    Running,
    /// Computation invoked.
    WaitingOnComputation,
    /// Computation answered.
    FinishedIteration,
    /// Remote exchange in flight.
    WaitingOnRemote,
    /// Remote answered.
    FinishedRemoteIteration,
    /// Final output transmitted to the sites.
    FinishedFinalRemoteIteration,
    /// Step complete.
    Stopped,
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::WaitingOnComputation => "waiting on computation",
            Self::FinishedIteration => "finished iteration",
            Self::WaitingOnRemote => "waiting on remote",
            Self::FinishedRemoteIteration => "finished remote iteration",
            Self::FinishedFinalRemoteIteration => "finished final remote iteration",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Controller state. Passed to the computation on every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    /// Pipeline run.
    pub run_id: String,
    /// Site identity.
    pub client_id: String,
    /// Step index.
    pub step: usize,
    /// Local site or aggregator.
    pub mode: OperatingMode,
    /// Completed local computations, +1 per iteration.
    pub iteration: u64,
    /// Lifecycle status.
    pub status: ControllerStatus,
    /// Output of the last computation or remote exchange.
    pub current_output: Option<StepOutput>,
    /// Aggregator has not made its first exchange yet.
    pub remote_initial: bool,
    /// Index of the running computation within the step.
    pub active_computation_index: usize,
    /// Input directory as seen by the worker.
    pub base_directory: String,
    /// Output directory as seen by the worker.
    pub output_directory: String,
    /// Cache directory as seen by the worker.
    pub cache_directory: String,
}

impl ControllerState {
    /// Fresh state for a step.
    #[must_use]
    pub fn new(run_id: &str, client_id: &str, step: usize, mode: OperatingMode) -> Self {
        Self {
            run_id: run_id.to_string(),
            client_id: client_id.to_string(),
            step,
            mode,
            iteration: 0,
            status: ControllerStatus::NotStarted,
            current_output: None,
            remote_initial: false,
            active_computation_index: 0,
            base_directory: CONTAINER_INPUT_DIR.to_string(),
            output_directory: CONTAINER_OUTPUT_DIR.to_string(),
            cache_directory: CONTAINER_CACHE_DIR.to_string(),
        }
    }

    fn succeeded(&self) -> bool {
        self.current_output.as_ref().is_some_and(|o| o.success)
    }
}

/// Progress report emitted on every controller transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    /// Pipeline run.
    pub run_id: String,
    /// Step index.
    pub step: usize,
    /// Controller iteration.
    pub iteration: u64,
    /// Controller status.
    pub status: ControllerStatus,
    /// Local site or aggregator.
    pub mode: OperatingMode,
}

// =============================================================================
// Control Boxes
// =============================================================================

/// Next action chosen by a control box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlAction {
    /// Run the computation once more.
    NextIteration,
    /// Exchange the current output with the remote side.
    Remote,
    /// Aggregator's first exchange: wait for the sites' outputs.
    FirstServerRemote,
    /// Aggregator transmits the final output, then finishes.
    DoneRemote,
    /// Step complete.
    Done,
}

/// Policy choosing the controller's next action.
pub trait ControlBox: Send + Sync {
    /// Controller type this box implements.
    fn kind(&self) -> ControllerType;

    /// Picks the next action for `state`.
    fn next_action(&self, state: &ControllerState) -> ControlAction;
}

/// Iterates until the computation reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalControlBox;

impl ControlBox for LocalControlBox {
    fn kind(&self) -> ControllerType {
        ControllerType::Local
    }

    fn next_action(&self, state: &ControllerState) -> ControlAction {
        if state.succeeded() {
            ControlAction::Done
        } else {
            ControlAction::NextIteration
        }
    }
}

/// Alternates computations with remote exchanges.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecentralizedControlBox;

impl ControlBox for DecentralizedControlBox {
    fn kind(&self) -> ControllerType {
        ControllerType::Decentralized
    }

    fn next_action(&self, state: &ControllerState) -> ControlAction {
        if state.succeeded() {
            if state.mode == OperatingMode::Remote
                && state.status == ControllerStatus::FinishedIteration
            {
                return ControlAction::DoneRemote;
            }
            return ControlAction::Done;
        }
        if state.remote_initial {
            return ControlAction::FirstServerRemote;
        }
        if state.status == ControllerStatus::FinishedIteration {
            return ControlAction::Remote;
        }
        ControlAction::NextIteration
    }
}

/// Control box for `kind`.
#[must_use]
pub fn control_box(kind: ControllerType) -> Box<dyn ControlBox> {
    match kind {
        ControllerType::Local => Box::new(LocalControlBox),
        ControllerType::Decentralized => Box::new(DecentralizedControlBox),
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Serialize)]
struct IterationInput<'a> {
    input: &'a Value,
    cache: &'a Map<String, Value>,
    state: &'a ControllerState,
}

/// Runs one pipeline step.
pub struct Controller {
    control: Box<dyn ControlBox>,
    computation: Computation,
    state: ControllerState,
    cache: Map<String, Value>,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("kind", &self.control.kind())
            .field("computation", &self.computation.spec().id)
            .field("state", &self.state)
            .finish()
    }
}

impl Controller {
    /// Controller for `computation` driven by `control`.
    #[must_use]
    pub fn new(control: Box<dyn ControlBox>, computation: Computation, state: ControllerState) -> Self {
        Self {
            control,
            computation,
            state,
            cache: Map::new(),
            events: None,
        }
    }

    /// Emits progress on `events`.
    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Accumulated cache.
    #[must_use]
    pub fn cache(&self) -> &Map<String, Value> {
        &self.cache
    }

    /// The step's computation.
    #[must_use]
    pub fn computation(&self) -> &Computation {
        &self.computation
    }

    fn set_status(&mut self, status: ControllerStatus) {
        self.state.status = status;
        if let Some(events) = &self.events {
            let progress = PipelineEvent::Step(StepProgress {
                run_id: self.state.run_id.clone(),
                step: self.state.step,
                iteration: self.state.iteration,
                status,
                mode: self.state.mode,
            });
            if events.send(progress).is_err() {
                debug!(run_id = %self.state.run_id, %status, "no event subscriber for step progress");
            }
        }
    }

    fn cancelled(&self) -> Error {
        Error::Cancelled(self.state.run_id.clone())
    }

    /// Runs the step from `input` until its control box says done and
    /// returns the final output.
    ///
    /// # Errors
    ///
    /// Returns the first computation or remote failure, or
    /// [`Error::Cancelled`] once `cancel` fires.
    pub async fn start(
        &mut self,
        input: Value,
        remote: &dyn RemoteHandler,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.state.remote_initial = self.state.mode == OperatingMode::Remote;
        self.set_status(ControllerStatus::Running);
        let mut input = input;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            let action = self.control.next_action(&self.state);
            debug!(
                run_id = %self.state.run_id,
                step = self.state.step,
                iteration = self.state.iteration,
                ?action,
                "controller cycle"
            );
            self.state.remote_initial = false;

            match action {
                ControlAction::NextIteration => {
                    self.state.iteration += 1;
                    self.set_status(ControllerStatus::WaitingOnComputation);
                    let payload = IterationInput {
                        input: &input,
                        cache: &self.cache,
                        state: &self.state,
                    };
                    let output = tokio::select! {
                        result = self.computation.start(&payload) => result?,
                        () = cancel.cancelled() => return Err(self.cancelled()),
                    };
                    self.cache.extend(output.cache);
                    input = output.output.clone();
                    self.state.current_output = Some(StepOutput {
                        output: output.output,
                        success: output.success,
                    });
                    self.set_status(ControllerStatus::FinishedIteration);
                }
                ControlAction::Remote | ControlAction::FirstServerRemote => {
                    let exchange = if action == ControlAction::FirstServerRemote {
                        RemoteExchange::First
                    } else {
                        RemoteExchange::Iteration
                    };
                    let response = self.exchange(remote, exchange, cancel).await?;
                    input = response.output.clone();
                    self.state.current_output = Some(response);
                    self.set_status(ControllerStatus::FinishedRemoteIteration);
                }
                ControlAction::DoneRemote => {
                    self.exchange(remote, RemoteExchange::Final, cancel).await?;
                    self.set_status(ControllerStatus::FinishedFinalRemoteIteration);
                    return Ok(self.finish(input));
                }
                ControlAction::Done => return Ok(self.finish(input)),
            }
        }
    }

    async fn exchange(
        &mut self,
        remote: &dyn RemoteHandler,
        exchange: RemoteExchange,
        cancel: &CancellationToken,
    ) -> Result<StepOutput> {
        self.set_status(ControllerStatus::WaitingOnRemote);
        let request = RemoteRequest {
            run_id: self.state.run_id.clone(),
            step: self.state.step,
            iteration: self.state.iteration,
            exchange,
            output: if exchange == RemoteExchange::First {
                None
            } else {
                self.state.current_output.clone()
            },
        };
        tokio::select! {
            result = remote.exchange(request) => result,
            () = cancel.cancelled() => Err(self.cancelled()),
        }
    }

    fn finish(&mut self, output: Value) -> Value {
        self.set_status(ControllerStatus::Stopped);
        info!(
            run_id = %self.state.run_id,
            step = self.state.step,
            iterations = self.state.iteration,
            "step finished"
        );
        output
    }
}

/// Builds the controller of step `index`.
#[must_use]
pub(crate) fn for_step(
    kind: ControllerType,
    computation: Computation,
    run_id: &str,
    client_id: &str,
    index: usize,
    mode: OperatingMode,
) -> Controller {
    Controller::new(
        control_box(kind),
        computation,
        ControllerState::new(run_id, client_id, index, mode),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(mode: OperatingMode) -> ControllerState {
        ControllerState::new("run", "site", 0, mode)
    }

    #[test]
    fn test_local_box() {
        let mut s = state(OperatingMode::Local);
        assert_eq!(LocalControlBox.next_action(&s), ControlAction::NextIteration);
        s.current_output = Some(StepOutput {
            output: json!({}),
            success: true,
        });
        assert_eq!(LocalControlBox.next_action(&s), ControlAction::Done);
    }

    #[test]
    fn test_decentralized_site() {
        let mut s = state(OperatingMode::Local);
        let b = DecentralizedControlBox;
        assert_eq!(b.next_action(&s), ControlAction::NextIteration);
        s.status = ControllerStatus::FinishedIteration;
        assert_eq!(b.next_action(&s), ControlAction::Remote);
        s.status = ControllerStatus::FinishedRemoteIteration;
        assert_eq!(b.next_action(&s), ControlAction::NextIteration);
        s.current_output = Some(StepOutput {
            output: json!({}),
            success: true,
        });
        assert_eq!(b.next_action(&s), ControlAction::Done);
    }

    #[test]
    fn test_decentralized_aggregator() {
        let mut s = state(OperatingMode::Remote);
        let b = DecentralizedControlBox;
        s.remote_initial = true;
        assert_eq!(b.next_action(&s), ControlAction::FirstServerRemote);
        s.remote_initial = false;
        s.status = ControllerStatus::FinishedRemoteIteration;
        assert_eq!(b.next_action(&s), ControlAction::NextIteration);
        s.status = ControllerStatus::FinishedIteration;
        assert_eq!(b.next_action(&s), ControlAction::Remote);
        s.current_output = Some(StepOutput {
            output: json!({}),
            success: true,
        });
        assert_eq!(b.next_action(&s), ControlAction::DoneRemote);
        s.status = ControllerStatus::FinishedFinalRemoteIteration;
        assert_eq!(b.next_action(&s), ControlAction::Done);
    }

    #[test]
    fn test_state_serializes_for_worker() {
        let value = serde_json::to_value(state(OperatingMode::Local)).unwrap();
        assert_eq!(value["baseDirectory"], "/input");
        assert_eq!(value["status"], "not-started");
        assert_eq!(value["iteration"], 0);
    }
}
