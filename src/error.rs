//! Error types for the orchestration engine.

use std::io::ErrorKind;
use std::path::PathBuf;

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating worker services and pipelines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Service Lifecycle Errors
    // =========================================================================
    /// Service not found in the service table.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Service identifier rejected by validation.
    #[error("invalid service ID '{id}': {reason}")]
    InvalidServiceId { id: String, reason: String },

    /// Service could not be started. Every waiter on the start receives this.
    #[error("failed to start service '{id}': {reason}")]
    ServiceStart { id: String, reason: String },

    /// Readiness attempts exhausted.
    #[error("service '{id}' not ready after {attempts} attempts")]
    ReadinessTimeout { id: String, attempts: u32 },

    // =========================================================================
    // Port Allocation Errors
    // =========================================================================
    /// Host port collided with another binding.
    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    /// No free, non-blacklisted port left in the configured range.
    #[error("no free port in range {start}..={end}")]
    PortsExhausted { start: u16, end: u16 },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Container engine API error.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Backend CLI invocation failed.
    #[error("command '{command}' failed (status {status}): {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// Backend not usable on this host.
    #[error("backend '{backend}' not available: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// Image not found locally.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Malformed worker protocol frame.
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    /// Worker connection closed before the invocation completed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // =========================================================================
    // Computation Errors
    // =========================================================================
    /// Worker process exited with a failure.
    #[error("Computation failed with exitcode {code} and stderr {stderr}")]
    ComputationExit { code: i32, stderr: String },

    /// Worker stdout was not the expected JSON document.
    #[error("invalid computation output from '{computation}': {reason}")]
    InvalidComputationOutput { computation: String, reason: String },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// Pipeline specification rejected.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// Input mapping could not be resolved.
    #[error("input mapping for step {step} failed: {reason}")]
    InputMapping { step: usize, reason: String },

    /// Remote handler failed.
    #[error("remote exchange failed: {0}")]
    Remote(String),

    /// Run cancelled by `stop_pipeline`.
    #[error("pipeline run '{0}' cancelled")]
    Cancelled(String),

    /// Run not known to the pipeline manager.
    #[error("pipeline run not found: {0}")]
    RunNotFound(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Run directory could not be prepared.
    #[error("failed to prepare directory {path}: {reason}")]
    DirectoryFailed { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Returns true if the error is a host port collision that a retry with a
    /// fresh port can resolve.
    #[must_use]
    pub fn is_port_race(&self) -> bool {
        match self {
            Self::PortAllocation(_) => true,
            Self::Docker(e) => is_port_race_message(&e.to_string()),
            Self::CommandFailed { stderr, .. } => is_port_race_message(stderr),
            Self::ServiceStart { reason, .. } => is_port_race_message(reason),
            _ => false,
        }
    }

    /// Returns true if the error means the worker hung up or is not listening
    /// yet.
    #[must_use]
    pub fn is_connection_reset(&self) -> bool {
        match self {
            Self::ConnectionClosed(_) => true,
            Self::Io(e) => is_reset_kind(e.kind()),
            Self::WebSocket(e) => {
                use tokio_tungstenite::tungstenite::Error as WsError;
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => true,
                    WsError::Io(io) => is_reset_kind(io.kind()),
                    WsError::Protocol(p) => matches!(
                        p,
                        tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
                    ),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Returns the exit code carried by a computation failure.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ComputationExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn is_port_race_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("port is already allocated")
        || msg.contains("address already in use")
        || msg.contains("bind for")
}

// Refused is included: a worker that has not bound its socket yet refuses
// rather than resets on most hosts.
fn is_reset_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
