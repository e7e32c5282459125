//! Binding of a computation to its worker service.
//!
//! A computation owns no container itself: it asks the service manager for
//! the service keyed by its run and ID, invokes it once per iteration and
//! releases it when its step is done.
//!
//! Directory layout inside the worker:
//!
//! | Host | Container | Mode |
//! |------|-----------|------|
//! | `<operating dir>/<run>` | `/input` | ro |
//! | `<operating dir>/output/<run>` | `/output` | rw |
//! | `<operating dir>/cache/<run>` | `/cache` | rw |

use super::spec::ComputationSpec;
use crate::backend::{Mount, ServiceOptions};
use crate::config::OperatingMode;
use crate::constants::{
    CACHE_DIR, CONTAINER_CACHE_DIR, CONTAINER_INPUT_DIR, CONTAINER_OUTPUT_DIR, MAX_SERVICE_ID_LEN,
    OUTPUT_DIR, SERVICE_ID_VALID_CHARS,
};
use crate::error::{Error, Result};
use crate::protocol::{ControlFrame, Invocation};
use crate::service::ServiceManager;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Per-run host directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectories {
    /// Input directory, `<operating dir>/<run>`.
    pub input: PathBuf,
    /// Output directory, `<operating dir>/output/<run>`.
    pub output: PathBuf,
    /// Cache directory, `<operating dir>/cache/<run>`.
    pub cache: PathBuf,
}

impl RunDirectories {
    /// Directories of `run_id` under `operating_directory`.
    #[must_use]
    pub fn new(operating_directory: &Path, run_id: &str) -> Self {
        Self {
            input: operating_directory.join(run_id),
            output: operating_directory.join(OUTPUT_DIR).join(run_id),
            cache: operating_directory.join(CACHE_DIR).join(run_id),
        }
    }

    /// Creates all three directories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirectoryFailed`] naming the directory that could not
    /// be created.
    pub async fn create(&self) -> Result<()> {
        for dir in [&self.input, &self.output, &self.cache] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::DirectoryFailed {
                    path: dir.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Worker mounts for these directories.
    #[must_use]
    pub fn mounts(&self) -> Vec<Mount> {
        vec![
            Mount::read_only(&self.input, CONTAINER_INPUT_DIR),
            Mount::new(&self.output, CONTAINER_OUTPUT_DIR),
            Mount::new(&self.cache, CONTAINER_CACHE_DIR),
        ]
    }
}

/// Joins `parts` with `-` and replaces characters not allowed in service
/// IDs, truncating to the maximum length.
#[must_use]
pub fn service_key(parts: &[&str]) -> String {
    let mut key: String = parts
        .join("-")
        .chars()
        .map(|c| if SERVICE_ID_VALID_CHARS.contains(c) { c } else { '-' })
        .collect();
    key.truncate(MAX_SERVICE_ID_LEN);
    key
}

/// What the worker prints on stdout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputationOutput {
    /// Output passed to the next iteration.
    #[serde(default)]
    pub output: Value,
    /// Cache entries merged into the controller cache.
    #[serde(default)]
    pub cache: Map<String, Value>,
    /// Set when the computation converged.
    #[serde(default)]
    pub success: bool,
}

impl ComputationOutput {
    /// Parses worker stdout. Log lines before the result are skipped: if the
    /// whole output is not JSON, the last line that is gets used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidComputationOutput`] if no JSON result is
    /// found.
    pub fn parse(computation: &str, stdout: &str) -> Result<Self> {
        let trimmed = stdout.trim();
        if let Ok(output) = serde_json::from_str(trimmed) {
            return Ok(output);
        }
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| Error::InvalidComputationOutput {
                computation: computation.to_string(),
                reason: if trimmed.is_empty() {
                    "empty stdout".to_string()
                } else {
                    let preview: String = trimmed.chars().take(200).collect();
                    format!("stdout is not a JSON result: {preview}")
                },
            })
    }
}

/// One computation of one run.
#[derive(Debug, Clone)]
pub struct Computation {
    spec: ComputationSpec,
    services: ServiceManager,
    service_id: String,
    user_id: String,
    directories: RunDirectories,
}

impl Computation {
    /// Binds `spec`, resolved for `mode`, to the service manager.
    #[must_use]
    pub fn new(
        spec: &ComputationSpec,
        mode: OperatingMode,
        services: ServiceManager,
        run_id: &str,
        client_id: &str,
        directories: RunDirectories,
    ) -> Self {
        Self {
            spec: spec.for_mode(mode),
            services,
            service_id: service_key(&[run_id, &spec.id]),
            user_id: service_key(&[run_id, client_id]),
            directories,
        }
    }

    /// Effective spec.
    #[must_use]
    pub fn spec(&self) -> &ComputationSpec {
        &self.spec
    }

    /// Service ID the computation runs under.
    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Runs one iteration with `input` serialized as the last argument.
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be started, the worker fails, or
    /// its stdout is not a result.
    #[instrument(skip(self, input), fields(computation = %self.spec.id))]
    pub async fn start<T: Serialize + ?Sized>(&self, input: &T) -> Result<ComputationOutput> {
        let opts = self
            .directories
            .mounts()
            .into_iter()
            .fold(ServiceOptions::new(&self.spec.docker_image), |opts, mount| {
                opts.with_mount(mount)
            });
        let invoker = self
            .services
            .start_service(&self.service_id, &self.user_id, opts)
            .await?;

        let mut argv = self.spec.command.clone();
        argv.push(serde_json::to_string(input)?);
        let control = ControlFrame::from_argv(&argv)?;
        debug!(service_id = %self.service_id, command = %control.command, "running computation");

        let output = invoker.invoke(Invocation::new(control)).await?;
        ComputationOutput::parse(&self.spec.id, &output.stdout)
    }

    /// Releases the computation's service without waiting for the container
    /// to stop.
    ///
    /// # Errors
    ///
    /// Returns error only if the service table is unusable.
    pub async fn release(&self) -> Result<()> {
        self.services
            .stop_service(&self.service_id, &self.user_id, false)
            .await
    }
}
