//! Pipeline manager: starts, tracks and stops runs on one site.

use super::aggregate::RoundCollector;
use super::{Pipeline, PipelineEvent, PipelineSpec, RemoteHandler, RemoteRequest, RunDirectories};
use crate::config::{OperatingMode, PipelineManagerConfig};
use crate::constants::{validate_service_id, STATE_EVENT_CAPACITY};
use crate::error::{Error, Result};
use crate::service::ServiceManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Request to run a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    /// Unique run ID. Used in directory names and service IDs.
    pub run_id: String,
    /// Pipeline to run.
    pub spec: PipelineSpec,
    /// Wall-clock limit for the whole run, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Sites taking part, for aggregating runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<String>,
}

impl RunSpec {
    /// Run of `spec` without a time limit.
    #[must_use]
    pub fn new(run_id: impl Into<String>, spec: PipelineSpec) -> Self {
        Self {
            run_id: run_id.into(),
            spec,
            timeout: None,
            clients: Vec::new(),
        }
    }

    /// Sets the run time limit.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs().max(1));
        self
    }

    /// Sets the participating sites.
    #[must_use]
    pub fn with_clients<I, S>(mut self, clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clients = clients.into_iter().map(Into::into).collect();
        self
    }
}

/// Lifecycle of a run as tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    /// Accepted, directories not yet created.
    Created,
    /// Steps executing.
    Running,
    /// Stop requested.
    Stopping,
}

struct ActiveRun {
    client_id: String,
    state: RunState,
    cancel: CancellationToken,
    events: broadcast::Sender<PipelineEvent>,
    collector: Option<Arc<RoundCollector>>,
}

type RunTable = Arc<Mutex<HashMap<String, ActiveRun>>>;

fn lock_runs(runs: &RunTable) -> Result<MutexGuard<'_, HashMap<String, ActiveRun>>> {
    runs.lock()
        .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
}

fn mark_running(runs: &RunTable, run_id: &str) {
    if let Ok(mut table) = lock_runs(runs) {
        if let Some(active) = table.get_mut(run_id) {
            if active.state == RunState::Created {
                active.state = RunState::Running;
            }
        }
    }
}

fn remove_run(runs: &RunTable, run_id: &str) {
    if let Ok(mut table) = lock_runs(runs) {
        table.remove(run_id);
    }
}

/// Handle to a started run.
#[derive(Debug)]
pub struct PipelineRun {
    run_id: String,
    events: broadcast::Receiver<PipelineEvent>,
    result: JoinHandle<Result<Value>>,
}

impl PipelineRun {
    /// Run ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.run_id
    }

    /// Events of the run, subscribed before it started.
    pub fn events(&mut self) -> &mut broadcast::Receiver<PipelineEvent> {
        &mut self.events
    }

    /// Waits for the final output.
    ///
    /// # Errors
    ///
    /// Returns the run's failure, or [`Error::Internal`] if its task
    /// panicked.
    pub async fn wait(self) -> Result<Value> {
        self.result
            .await
            .map_err(|e| Error::Internal(format!("pipeline task failed: {e}")))?
    }
}

/// Runs pipelines for one site.
#[derive(Debug, Clone)]
pub struct PipelineManager {
    config: PipelineManagerConfig,
    services: ServiceManager,
    runs: RunTable,
}

impl std::fmt::Debug for ActiveRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRun")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("aggregating", &self.collector.is_some())
            .finish()
    }
}

impl PipelineManager {
    /// Creates a manager with a service manager built from `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the backend cannot
    /// be created.
    pub fn create(config: PipelineManagerConfig) -> Result<Self> {
        config.validate()?;
        let services = ServiceManager::from_config(&config.manager)?;
        Ok(Self::with_services(config, services))
    }

    /// Creates a manager over an existing service manager.
    #[must_use]
    pub fn with_services(config: PipelineManagerConfig, services: ServiceManager) -> Self {
        Self {
            config,
            services,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineManagerConfig {
        &self.config
    }

    /// Service manager shared by all runs.
    #[must_use]
    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    /// Starts `run` in the background.
    ///
    /// The run creates its directories, executes every step and reports the
    /// final output through [`PipelineRun::wait`].
    ///
    /// # Errors
    ///
    /// Returns error if the run ID is invalid or already active, or the
    /// pipeline spec is invalid.
    pub fn start_pipeline(
        &self,
        run: RunSpec,
        remote: Arc<dyn RemoteHandler>,
    ) -> Result<PipelineRun> {
        self.launch(run, remote, None)
    }

    /// Starts an aggregating run on the remote node. Remote exchanges wait
    /// for one output from each of `run.clients`, delivered through
    /// [`submit_client_output`](Self::submit_client_output).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPipeline`] if this manager is not in remote
    /// mode or the run names no clients, plus every
    /// [`start_pipeline`](Self::start_pipeline) error.
    pub fn start_aggregation(&self, run: RunSpec) -> Result<PipelineRun> {
        if self.config.mode != OperatingMode::Remote {
            return Err(Error::InvalidPipeline(format!(
                "run '{}' aggregates but this node runs in {} mode",
                run.run_id, self.config.mode
            )));
        }
        let collector = Arc::new(RoundCollector::new(run.run_id.clone(), run.clients.clone())?);
        self.launch(run, Arc::clone(&collector) as Arc<dyn RemoteHandler>, Some(collector))
    }

    fn launch(
        &self,
        run: RunSpec,
        remote: Arc<dyn RemoteHandler>,
        collector: Option<Arc<RoundCollector>>,
    ) -> Result<PipelineRun> {
        validate_service_id(&run.run_id).map_err(|reason| {
            Error::InvalidPipeline(format!("invalid run ID '{}': {reason}", run.run_id))
        })?;
        run.spec.validate()?;

        let (events, receiver) = broadcast::channel(STATE_EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        {
            let mut runs = lock_runs(&self.runs)?;
            if runs.contains_key(&run.run_id) {
                return Err(Error::InvalidPipeline(format!(
                    "run '{}' is already active",
                    run.run_id
                )));
            }
            runs.insert(
                run.run_id.clone(),
                ActiveRun {
                    client_id: self.config.client_id.clone(),
                    state: RunState::Created,
                    cancel: cancel.clone(),
                    events: events.clone(),
                    collector,
                },
            );
        }

        let directories = RunDirectories::new(&self.config.operating_directory, &run.run_id);
        let pipeline = Pipeline::new(
            run.run_id.clone(),
            self.config.client_id.clone(),
            self.config.mode,
            run.spec,
            self.services.clone(),
            directories.clone(),
            events.clone(),
        );
        let runs = Arc::clone(&self.runs);
        let run_id = run.run_id.clone();
        let limit = run.timeout.map(Duration::from_secs);
        info!(run_id = %run_id, mode = %self.config.mode, "starting pipeline");

        let result = tokio::spawn(async move {
            // Expiry cancels the child token only; `cancel` stays clean.
            let token = cancel.child_token();
            let timer = limit.map(|duration| {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    token.cancel();
                })
            });
            let outcome: Result<Value> = async {
                directories.create().await?;
                mark_running(&runs, &run_id);
                pipeline.run(remote.as_ref(), &token).await
            }
            .await;
            if let Some(timer) = timer {
                timer.abort();
            }
            let outcome = match (outcome, limit) {
                (Err(Error::Cancelled(_)), Some(duration)) if !cancel.is_cancelled() => {
                    Err(Error::Timeout {
                        operation: format!("pipeline run '{run_id}'"),
                        duration,
                    })
                }
                (outcome, _) => outcome,
            };

            remove_run(&runs, &run_id);
            let event = match &outcome {
                Ok(output) => {
                    info!(run_id = %run_id, "pipeline finished");
                    PipelineEvent::Finished {
                        run_id: run_id.clone(),
                        output: output.clone(),
                    }
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "pipeline failed");
                    PipelineEvent::Failed {
                        run_id: run_id.clone(),
                        error: e.to_string(),
                    }
                }
            };
            if events.send(event).is_err() {
                debug!(run_id = %run_id, "no event subscriber for run outcome");
            }
            outcome
        });

        Ok(PipelineRun {
            run_id: run.run_id,
            events: receiver,
            result,
        })
    }

    /// Cancels the run `run_id` owned by `client_id`. The run releases its
    /// services as it unwinds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if no such run is active.
    pub fn stop_pipeline(&self, client_id: &str, run_id: &str) -> Result<()> {
        let mut runs = lock_runs(&self.runs)?;
        let active = runs
            .get_mut(run_id)
            .filter(|active| active.client_id == client_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        info!(run_id, client_id, "stopping pipeline");
        active.state = RunState::Stopping;
        active.cancel.cancel();
        Ok(())
    }

    /// Subscribes to the events of an active run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the run is not active.
    pub fn subscribe(&self, run_id: &str) -> Result<broadcast::Receiver<PipelineEvent>> {
        lock_runs(&self.runs)?
            .get(run_id)
            .map(|active| active.events.subscribe())
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// Records a site's output for the current round of the aggregating run
    /// `run_id` and returns the sites still outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the run is not active,
    /// [`Error::Remote`] if it does not aggregate or `client_id` is not one
    /// of its sites.
    pub fn submit_client_output(
        &self,
        run_id: &str,
        client_id: &str,
        output: Value,
    ) -> Result<Vec<String>> {
        let (collector, events) = {
            let runs = lock_runs(&self.runs)?;
            let active = runs
                .get(run_id)
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
            let collector = active.collector.clone().ok_or_else(|| {
                Error::Remote(format!("run '{run_id}' does not aggregate site outputs"))
            })?;
            (collector, active.events.clone())
        };
        let waiting_on = collector.submit(client_id, output)?;
        if events
            .send(PipelineEvent::WaitingOn {
                run_id: run_id.to_string(),
                clients: waiting_on.clone(),
            })
            .is_err()
        {
            debug!(run_id, "no event subscriber for waiting-on update");
        }
        Ok(waiting_on)
    }

    /// Sites whose output for the current round of `run_id` has not
    /// arrived. Empty for runs that do not aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the run is not active.
    pub fn waiting_on(&self, run_id: &str) -> Result<Vec<String>> {
        let runs = lock_runs(&self.runs)?;
        let active = runs
            .get(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        Ok(active
            .collector
            .as_ref()
            .map(|collector| collector.waiting_on())
            .unwrap_or_default())
    }

    /// Subscribes to the outputs an aggregating run sends to its sites.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the run is not active and
    /// [`Error::Remote`] if it does not aggregate.
    pub fn outbound(&self, run_id: &str) -> Result<broadcast::Receiver<RemoteRequest>> {
        let runs = lock_runs(&self.runs)?;
        let active = runs
            .get(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        active
            .collector
            .as_ref()
            .map(|collector| collector.outbound())
            .ok_or_else(|| Error::Remote(format!("run '{run_id}' does not aggregate site outputs")))
    }

    /// State of an active run.
    #[must_use]
    pub fn run_state(&self, run_id: &str) -> Option<RunState> {
        lock_runs(&self.runs).ok()?.get(run_id).map(|active| active.state)
    }

    /// IDs of the active runs, sorted.
    #[must_use]
    pub fn active_runs(&self) -> Vec<String> {
        let Ok(runs) = lock_runs(&self.runs) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = runs.keys().cloned().collect();
        ids.sort();
        ids
    }
}
