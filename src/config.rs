//! Engine configuration.
//!
//! [`ManagerConfig`] drives the service manager and its backends.
//! [`PipelineManagerConfig`] wraps it with the per-client settings the
//! pipeline manager needs. Both deserialize from JSON with defaults for every
//! field, and [`ManagerConfig::from_env`] overlays `FEDRUN_*` variables.

use crate::constants::{DEFAULT_PORT_START, MAX_SERVICE_PORT, WORKER_CONTAINER_PORT};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Backend / Transport Selection
// =============================================================================

/// Execution backend for worker services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Container engine reached over its API socket.
    #[default]
    Docker,
    /// Isolation tool driven through its CLI.
    Singularity,
}

impl BackendKind {
    /// Returns the backend name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Singularity => "singularity",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "singularity" => Ok(Self::Singularity),
            other => Err(Error::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// Wire transport spoken with the worker server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// WebSocket session per invocation.
    #[default]
    Ws,
    /// Raw HTTP with chunked transfer encoding.
    Http,
}

impl Transport {
    /// Returns the transport name as passed to the worker.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" | "websocket" => Ok(Self::Ws),
            "http" => Ok(Self::Http),
            other => Err(Error::Config(format!("unknown transport '{other}'"))),
        }
    }
}

// =============================================================================
// Manager Configuration
// =============================================================================

/// Configuration of the container service manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Execution backend.
    pub backend: BackendKind,
    /// Worker transport.
    pub transport: Transport,
    /// Host the worker ports are bound on.
    pub host: String,
    /// First port handed out to services.
    pub port_start: u16,
    /// Last port handed out to services.
    pub port_end: u16,
    /// Port the worker listens on inside the container.
    pub worker_port: u16,
    /// Directory holding Singularity image files.
    pub image_directory: PathBuf,
    /// Verbose logging inside workers plus debug port publishing.
    pub debug: bool,
    /// Request all GPUs for worker containers.
    pub gpu: bool,
    /// Docker network mode for worker containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            transport: Transport::default(),
            host: "127.0.0.1".to_string(),
            port_start: DEFAULT_PORT_START,
            port_end: MAX_SERVICE_PORT,
            worker_port: WORKER_CONTAINER_PORT,
            image_directory: default_image_directory(),
            debug: false,
            gpu: false,
            network_mode: None,
        }
    }
}

impl ManagerConfig {
    /// Default configuration overlaid with `FEDRUN_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a variable holds an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Overlays `FEDRUN_*` environment variables on this configuration.
    ///
    /// `CI_PORT_START` is honoured when `FEDRUN_PORT_START` is unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a variable holds an unparsable value.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_var("FEDRUN_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = env_var("FEDRUN_TRANSPORT") {
            self.transport = v.parse()?;
        }
        if let Some(v) = env_var("FEDRUN_PORT_START").or_else(|| env_var("CI_PORT_START")) {
            self.port_start = v
                .parse()
                .map_err(|_| Error::Config(format!("invalid port start '{v}'")))?;
        }
        if let Some(v) = env_var("FEDRUN_HOST") {
            self.host = v;
        }
        if let Some(v) = env_var("FEDRUN_IMAGE_DIR") {
            self.image_directory = PathBuf::from(v);
        }
        if let Some(v) = env_var("FEDRUN_DEBUG") {
            self.debug = parse_flag(&v);
        }
        self.validate()?;
        Ok(self)
    }

    /// Validates the port range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the range is empty or starts at zero.
    pub fn validate(&self) -> Result<()> {
        if self.port_start == 0 {
            return Err(Error::Config("port start must be non-zero".to_string()));
        }
        if self.port_start > self.port_end {
            return Err(Error::Config(format!(
                "port start {} exceeds port end {}",
                self.port_start, self.port_end
            )));
        }
        if self.host.is_empty() {
            return Err(Error::Config("host cannot be empty".to_string()));
        }
        Ok(())
    }
}

fn default_image_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fedrun")
        .join("images")
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// =============================================================================
// Pipeline Manager Configuration
// =============================================================================

/// Role of this node in decentralized steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Site running local computations.
    #[default]
    Local,
    /// Aggregator running remote computations.
    Remote,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Configuration of a [`crate::pipeline::PipelineManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineManagerConfig {
    /// Identity of this site.
    pub client_id: String,
    /// Local site or remote aggregator.
    pub mode: OperatingMode,
    /// Root of the per-run input, output and cache directories.
    pub operating_directory: PathBuf,
    /// Service manager settings.
    pub manager: ManagerConfig,
}

impl Default for PipelineManagerConfig {
    fn default() -> Self {
        Self {
            client_id: "local".to_string(),
            mode: OperatingMode::default(),
            operating_directory: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fedrun")
                .join("runs"),
            manager: ManagerConfig::default(),
        }
    }
}

impl PipelineManagerConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on an empty client ID or invalid manager
    /// settings.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::Config("client ID cannot be empty".to_string()));
        }
        self.manager.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.port_start, 8101);
        assert_eq!(cfg.port_end, 49151);
        assert_eq!(cfg.worker_port, 8881);
        assert_eq!(cfg.host, "127.0.0.1");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let cfg: ManagerConfig =
            serde_json::from_str(r#"{"backend":"singularity","transport":"http"}"#).unwrap();
        assert_eq!(cfg.backend, BackendKind::Singularity);
        assert_eq!(cfg.transport, Transport::Http);
        assert_eq!(cfg.port_start, 8101);
    }

    #[test]
    fn test_invalid_range() {
        let cfg = ManagerConfig {
            port_start: 9000,
            port_end: 8000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
