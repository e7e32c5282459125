//! # Pipelines
//!
//! A pipeline runs its steps strictly in order. Each step gets one
//! [`Controller`] bound to one [`Computation`]; the step's input is assembled
//! from its input map and earlier outputs, and its final output is kept for
//! the steps after it.
//!
//! ```text
//!   PipelineManager::start_pipeline(run)
//!        │ create <dir>/<run>, <dir>/output/<run>, <dir>/cache/<run>
//!        ▼
//!   Pipeline::run ── step 0 ─► Controller ─► Computation ─► ServiceManager
//!        │            output ──┐
//!        │                     ▼ input map
//!        ├──────── step 1 ─► Controller ─► ...
//!        ▼
//!   final output of the last step
//! ```
//!
//! Progress is published as [`PipelineEvent`]s on a broadcast channel.

pub mod aggregate;
pub mod computation;
pub mod controller;
mod manager;
pub mod remote;
pub mod spec;

pub use self::aggregate::RoundCollector;
pub use self::computation::{Computation, ComputationOutput, RunDirectories};
pub use self::controller::{
    ControlAction, ControlBox, Controller, ControllerState, ControllerStatus, StepProgress,
};
pub use self::manager::{PipelineManager, PipelineRun, RunSpec, RunState};
pub use self::remote::{NoRemote, RemoteExchange, RemoteHandler, RemoteRequest, StepOutput};
pub use self::spec::{ComputationSpec, ControllerType, InputSource, PipelineSpec, StepSpec};

use crate::config::OperatingMode;
use crate::error::{Error, Result};
use crate::service::ServiceManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Event published while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PipelineEvent {
    /// Controller transition.
    Step(StepProgress),
    /// Run finished with its final output.
    Finished {
        /// Pipeline run.
        #[serde(rename = "runId")]
        run_id: String,
        /// Final output.
        output: Value,
    },
    /// Sites an aggregating run still waits on, after each site output.
    WaitingOn {
        /// Pipeline run.
        #[serde(rename = "runId")]
        run_id: String,
        /// Outstanding sites, sorted.
        clients: Vec<String>,
    },
    /// Run failed or was cancelled.
    Failed {
        /// Pipeline run.
        #[serde(rename = "runId")]
        run_id: String,
        /// Error description.
        error: String,
    },
}

/// One run of a pipeline spec.
#[derive(Debug)]
pub struct Pipeline {
    run_id: String,
    client_id: String,
    mode: OperatingMode,
    spec: PipelineSpec,
    services: ServiceManager,
    directories: RunDirectories,
    events: broadcast::Sender<PipelineEvent>,
    current_step: AtomicUsize,
}

impl Pipeline {
    /// Creates a run of `spec`.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        client_id: impl Into<String>,
        mode: OperatingMode,
        spec: PipelineSpec,
        services: ServiceManager,
        directories: RunDirectories,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            client_id: client_id.into(),
            mode,
            spec,
            services,
            directories,
            events,
            current_step: AtomicUsize::new(0),
        }
    }

    /// Run ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.run_id
    }

    /// Index of the step running now, or last run.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::Relaxed)
    }

    /// Subscribes to the run's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Runs every step in order and returns the last step's output.
    ///
    /// Each step's services are released when the step ends, whether it
    /// succeeded or not.
    ///
    /// # Errors
    ///
    /// Returns the first step failure; later steps do not run.
    pub async fn run(&self, remote: &dyn RemoteHandler, cancel: &CancellationToken) -> Result<Value> {
        self.spec.validate()?;
        let mut outputs: Vec<Value> = Vec::with_capacity(self.spec.steps.len());

        for (index, step) in self.spec.steps.iter().enumerate() {
            self.current_step.store(index, Ordering::Relaxed);
            let input = step.build_input(index, &outputs)?;
            let spec = step.computations.first().ok_or_else(|| {
                Error::InvalidPipeline(format!("step {index} has no computation"))
            })?;
            let computation = Computation::new(
                spec,
                self.mode,
                self.services.clone(),
                &self.run_id,
                &self.client_id,
                self.directories.clone(),
            );
            info!(
                run_id = %self.run_id,
                step = index,
                controller = %step.controller,
                computation = %spec.id,
                "starting step"
            );

            let mut controller = controller::for_step(
                step.controller,
                computation,
                &self.run_id,
                &self.client_id,
                index,
                self.mode,
            )
            .with_events(self.events.clone());
            let result = controller.start(input, remote, cancel).await;

            if let Err(e) = controller.computation().release().await {
                warn!(run_id = %self.run_id, step = index, error = %e, "failed to release step services");
            }
            outputs.push(result?);
        }

        Ok(outputs.pop().unwrap_or(Value::Null))
    }
}
