//! Execution backends for worker services.
//!
//! A backend turns `(service_id, port, options)` into a running worker and
//! hands back an invoker plus a handle to the underlying container. The
//! service manager is backend-agnostic; it only sees [`ServiceBackend`].
//!
//! | Backend | Mechanism | Port binding | Liveness check |
//! |---------|-----------|--------------|----------------|
//! | [`DockerBackend`] | Engine API (bollard) | host port → worker port | `inspect` state |
//! | [`SingularityBackend`] | `singularity instance` CLI | worker listens on host port | `instance list --json` |

pub mod docker;
pub mod singularity;

pub use self::docker::DockerBackend;
pub use self::singularity::SingularityBackend;

use crate::config::{BackendKind, ManagerConfig};
use crate::error::{Error, Result};
use crate::protocol::ServiceInvoker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Service Options
// =============================================================================

/// Host directory bound into the worker container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path.
    pub source: PathBuf,
    /// Container path.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Read-write mount.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// Read-only mount.
    #[must_use]
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(source, target)
        }
    }

    /// `source:target[:ro]`, the bind syntax both backends accept.
    #[must_use]
    pub fn to_bind_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            spec.push_str(":ro");
        }
        spec
    }

    /// Parses `source:target[:ro|:rw]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a spec without a target or with an
    /// unknown mode.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [source, target] if !source.is_empty() && !target.is_empty() => {
                Ok(Self::new(*source, *target))
            }
            [source, target, "ro"] if !source.is_empty() && !target.is_empty() => {
                Ok(Self::read_only(*source, *target))
            }
            [source, target, "rw"] if !source.is_empty() && !target.is_empty() => {
                Ok(Self::new(*source, *target))
            }
            _ => Err(Error::Config(format!("invalid mount spec '{spec}'"))),
        }
    }
}

/// Options for one worker service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Worker image reference.
    pub image: String,
    /// Directories bound into the worker.
    pub mounts: Vec<Mount>,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Command prepended to the worker launch argument. Empty means the
    /// image's entrypoint is the worker.
    pub worker_command: Vec<String>,
}

impl ServiceOptions {
    /// Options for `image` with no mounts.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Adds a mount.
    #[must_use]
    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Adds an environment entry.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.set_env(key, value);
        self
    }

    /// Sets an environment entry, replacing an existing one for `key`.
    pub fn set_env(&mut self, key: &str, value: impl std::fmt::Display) {
        let prefix = format!("{key}=");
        self.env.retain(|e| !e.starts_with(&prefix));
        self.env.push(format!("{key}={value}"));
    }

    /// Returns the value of an environment entry.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.env
            .iter()
            .find_map(|e| e.strip_prefix(prefix.as_str()))
    }
}

// =============================================================================
// Backend Results
// =============================================================================

/// Running worker returned by [`ServiceBackend::create_service`].
pub struct CreatedService {
    /// Invoker for the worker.
    pub invoker: Arc<dyn ServiceInvoker>,
    /// Handle to the container or instance.
    pub container: Arc<dyn ContainerHandle>,
}

impl std::fmt::Debug for CreatedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedService")
            .field("endpoint", &self.invoker.endpoint())
            .field("container", &self.container.id())
            .finish()
    }
}

/// Locally stored worker image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Backend image ID (Docker ID or image file name).
    pub id: String,
    /// Repository tags.
    pub tags: Vec<String>,
    /// Size in bytes.
    pub size: u64,
    /// Creation time, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// One progress report while pulling an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    /// Image being pulled.
    pub image: String,
    /// Status line.
    pub status: String,
    /// Progress detail, when the backend reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Callback receiving pull progress.
pub type ProgressFn = Arc<dyn Fn(&PullProgress) + Send + Sync>;

/// Result of pruning unused images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Removed image IDs or tags.
    pub removed: Vec<String>,
    /// Bytes reclaimed.
    pub reclaimed: u64,
}

/// Per-image outcome of a batch image operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOutcome {
    /// Image reference.
    pub image: String,
    /// Error message when the operation failed for this image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageOutcome {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Worker container known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Backend identifier.
    pub id: String,
    /// Container or instance name.
    pub name: String,
    /// Image the container runs.
    pub image: String,
    /// Backend state, e.g. `running` or `exited`.
    pub state: String,
    /// Service the container belongs to, from its label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    /// Creation time, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// One resource usage snapshot of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Backend identifier.
    pub container_id: String,
    /// CPU usage over the sampling interval, 100 per busy core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    /// Memory in use, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    /// Memory limit, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,
    /// Backend's full report.
    pub raw: Value,
}

impl ContainerStats {
    /// Reads a Docker stats document (`GET /containers/{id}/stats`).
    ///
    /// CPU usage is the container's share of the system CPU time between
    /// the `precpu_stats` and `cpu_stats` samples, scaled by the online CPU
    /// count. It is absent when either sample is missing.
    #[must_use]
    pub fn from_docker_json(container_id: impl Into<String>, raw: Value) -> Self {
        let total = |key: &str| raw[key]["cpu_usage"]["total_usage"].as_u64();
        let system = |key: &str| raw[key]["system_cpu_usage"].as_u64();
        let cpu_percent = match (
            total("cpu_stats"),
            total("precpu_stats"),
            system("cpu_stats"),
            system("precpu_stats"),
        ) {
            (Some(cpu), Some(pre_cpu), Some(sys), Some(pre_sys)) if sys > pre_sys => {
                let cpus = raw["cpu_stats"]["online_cpus"].as_u64().unwrap_or(1).max(1);
                let cpu_delta = cpu.saturating_sub(pre_cpu) as f64;
                let system_delta = (sys - pre_sys) as f64;
                Some(cpu_delta / system_delta * cpus as f64 * 100.0)
            }
            _ => None,
        };
        Self {
            container_id: container_id.into(),
            cpu_percent,
            memory_usage: raw["memory_stats"]["usage"].as_u64(),
            memory_limit: raw["memory_stats"]["limit"].as_u64(),
            raw,
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Handle to a started container or instance.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Backend identifier of the container.
    fn id(&self) -> &str;

    /// Asks the backend whether the container is still running.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried.
    async fn is_running(&self) -> Result<bool>;

    /// Stops and removes the container.
    ///
    /// # Errors
    ///
    /// Returns error if the backend refuses to stop it.
    async fn stop(&self) -> Result<()>;
}

/// Uniform interface over execution backends.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Backend kind.
    fn kind(&self) -> BackendKind;

    /// Starts a worker for `service_id` reachable on host `port`.
    ///
    /// # Errors
    ///
    /// Returns error if the worker cannot be started. A host port collision
    /// satisfies [`Error::is_port_race`].
    async fn create_service(
        &self,
        service_id: &str,
        port: u16,
        opts: &ServiceOptions,
    ) -> Result<CreatedService>;

    /// Pulls `image`, reporting progress through `progress`.
    ///
    /// # Errors
    ///
    /// Returns error if the pull fails.
    async fn pull(&self, image: &str, progress: ProgressFn) -> Result<()>;

    /// Looks up one local image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ImageNotFound`] if it is not stored locally.
    async fn get_image(&self, image: &str) -> Result<ImageInfo>;

    /// Lists local images.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried.
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;

    /// Removes one local image.
    ///
    /// # Errors
    ///
    /// Returns error if the image cannot be removed.
    async fn remove_image(&self, image: &str) -> Result<()> {
        Err(Error::NotSupported(format!(
            "{} cannot remove image {image}",
            self.kind()
        )))
    }

    /// Removes unused images.
    ///
    /// # Errors
    ///
    /// Returns error if pruning fails or is unsupported.
    async fn prune_images(&self) -> Result<PruneReport> {
        Err(Error::NotSupported(format!(
            "{} does not support pruning",
            self.kind()
        )))
    }

    /// Lists the worker containers this backend started, stopped ones
    /// included.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried or cannot list.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Err(Error::NotSupported(format!(
            "{} cannot list containers",
            self.kind()
        )))
    }

    /// Takes one resource usage snapshot of a container.
    ///
    /// # Errors
    ///
    /// Returns error if the container is unknown or the backend reports no
    /// statistics.
    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats> {
        Err(Error::NotSupported(format!(
            "{} reports no statistics for {container_id}",
            self.kind()
        )))
    }

    /// Returns a container's stdout and stderr, optionally only the last
    /// `tail` lines.
    ///
    /// # Errors
    ///
    /// Returns error if the container is unknown or logs are unavailable.
    async fn container_logs(&self, container_id: &str, _tail: Option<usize>) -> Result<String> {
        Err(Error::NotSupported(format!(
            "{} keeps no logs for {container_id}",
            self.kind()
        )))
    }

    /// Checks that the backend is reachable.
    ///
    /// # Errors
    ///
    /// Returns error if it is not.
    async fn ping(&self) -> Result<()>;
}

/// Builds the backend selected by `config`.
///
/// # Errors
///
/// Returns [`Error::BackendUnavailable`] if the Docker socket cannot be
/// opened.
pub fn create_backend(config: &ManagerConfig) -> Result<Arc<dyn ServiceBackend>> {
    Ok(match config.backend {
        BackendKind::Docker => Arc::new(DockerBackend::connect(config)?),
        BackendKind::Singularity => Arc::new(SingularityBackend::new(config)),
    })
}

/// Worker log level derived from the debug switch.
pub(crate) fn worker_log_level(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Appends `:latest` when `image` carries neither tag nor digest.
#[must_use]
pub fn with_default_tag(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

/// Splits `repo[:tag]` into repository and tag, honouring registry ports.
#[must_use]
pub fn split_image_ref(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag)),
        _ => (image, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_spec() {
        let mount = Mount::read_only("/runs/r1", "/input");
        assert_eq!(mount.to_bind_spec(), "/runs/r1:/input:ro");
        assert_eq!(Mount::parse("/runs/r1:/input:ro").unwrap(), mount);
        assert_eq!(
            Mount::parse("/a:/b").unwrap().to_bind_spec(),
            "/a:/b"
        );
        assert!(Mount::parse("/only").is_err());
        assert!(Mount::parse("/a:/b:zz").is_err());
    }

    #[test]
    fn test_env_replace() {
        let mut opts = ServiceOptions::new("img").with_env("A", 1);
        opts.set_env("A", 2);
        assert_eq!(opts.env, vec!["A=2"]);
        assert_eq!(opts.env_value("A"), Some("2"));
        assert_eq!(opts.env_value("B"), None);
    }

    #[test]
    fn test_docker_stats() {
        let raw = serde_json::json!({
            "cpu_stats": {
                "cpu_usage": {"total_usage": 400},
                "system_cpu_usage": 2000,
                "online_cpus": 2
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 200},
                "system_cpu_usage": 1000
            },
            "memory_stats": {"usage": 1024, "limit": 4096}
        });
        let stats = ContainerStats::from_docker_json("c1", raw);
        assert!((stats.cpu_percent.unwrap() - 40.0).abs() < 1e-9);
        assert_eq!(stats.memory_usage, Some(1024));
        assert_eq!(stats.memory_limit, Some(4096));

        // One-shot reports carry no previous sample.
        let stats = ContainerStats::from_docker_json(
            "c1",
            serde_json::json!({"cpu_stats": {"cpu_usage": {"total_usage": 5}}}),
        );
        assert_eq!(stats.cpu_percent, None);
        assert_eq!(stats.memory_usage, None);
    }

    #[test]
    fn test_image_refs() {
        assert_eq!(with_default_tag("org/comp"), "org/comp:latest");
        assert_eq!(with_default_tag("org/comp:v2"), "org/comp:v2");
        assert_eq!(
            with_default_tag("localhost:5000/comp"),
            "localhost:5000/comp:latest"
        );
        assert_eq!(split_image_ref("org/comp:v2"), ("org/comp", Some("v2")));
        assert_eq!(
            split_image_ref("localhost:5000/comp"),
            ("localhost:5000/comp", None)
        );
    }
}
