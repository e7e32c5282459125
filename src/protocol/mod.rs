//! Worker wire protocol.
//!
//! Every invocation of a worker service is one connection: the host sends a
//! control frame naming the process to spawn, streams the process's stdin,
//! and reads back the multiplexed stdout, stderr and exit code.
//!
//! # Transports
//!
//! ```text
//! HTTP (chunked)                         WebSocket
//! ──────────────                         ─────────
//! POST / HTTP/1.1                        Text   {"command","args"}
//! Transfer-Encoding: chunked             Binary <stdin bytes>...
//!                                        Binary <empty>          (stdin EOF)
//! <hex>\r\n{"command","args"}\r\n
//! <hex>\r\n<stdin bytes>\r\n ...         ◄ Text {"type":"stdout","data","end":false}
//! 0\r\n\r\n                              ◄ Text {"type":"stdout","end":true}
//!                                        ◄ Text {"type":"stderr",...}
//! ◄ HTTP/1.1 200 OK (chunked)            ◄ Text {"type":"close","code":0}
//! ◄ stdoutSTART\n...stdoutEND\n          ◄ Text {"type":"error","error"}
//! ◄ stderrSTART\n...stderrEND\n
//! ◄ exitcodeSTART\n<code>exitcodeEND\n
//! ```
//!
//! Both directions are byte-stream state machines ([`http::ResponseDecoder`],
//! [`http::RequestDecoder`], [`ws::WsAccumulator`]) that produce the same
//! result regardless of how TCP segments the stream.
//!
//! The framing is the compatibility surface toward worker images and must not
//! change.

pub mod client;
pub mod http;
pub mod server;
pub mod ws;

pub use client::{HttpInvoker, WsInvoker, connect_invoker};
pub use server::{WorkerConfig, serve};
pub use ws::{WsAccumulator, WsEvent};

use crate::config::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// =============================================================================
// Control Frame
// =============================================================================

/// First message of every invocation: the process to spawn in the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Executable.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ControlFrame {
    /// Creates a control frame.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Splits an argv-style vector into command and arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] if `argv` is empty.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (command, args) = argv
            .split_first()
            .ok_or_else(|| Error::ProtocolParse("empty command".to_string()))?;
        Ok(Self::new(command.clone(), args.to_vec()))
    }

    /// The `echo test` request used to check worker readiness.
    #[must_use]
    pub fn readiness_echo() -> Self {
        Self::new("echo", vec!["test".to_string()])
    }

    /// Serializes to compact JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] if the bytes are not a control frame.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| Error::ProtocolParse(format!("invalid control frame: {e}")))
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// One call to a running worker service.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Process to spawn.
    pub control: ControlFrame,
    /// Bytes written to the process's stdin before EOF.
    pub input: Bytes,
}

impl Invocation {
    /// Invocation with empty stdin.
    #[must_use]
    pub fn new(control: ControlFrame) -> Self {
        Self {
            control,
            input: Bytes::new(),
        }
    }

    /// Sets the stdin payload.
    #[must_use]
    pub fn with_input(mut self, input: impl Into<Bytes>) -> Self {
        self.input = input.into();
        self
    }
}

/// Exit code recorded when the worker never reported one (spawn failure or
/// signal).
pub const NO_EXIT_CODE: i32 = -1;

/// Collected result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOutput {
    /// Concatenated stdout.
    pub stdout: String,
    /// Concatenated stderr.
    pub stderr: String,
    /// Process exit code.
    pub code: i32,
}

impl InvocationOutput {
    /// Returns true if the process exited cleanly.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Converts a non-zero exit code into [`Error::ComputationExit`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ComputationExit`] on a non-zero code.
    pub fn check_exit(self) -> Result<Self> {
        if self.code != 0 {
            return Err(Error::ComputationExit {
                code: self.code,
                stderr: self.stderr,
            });
        }
        Ok(self)
    }

    /// Like [`check_exit`](Self::check_exit), but also fails on any stderr
    /// output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ComputationExit`] on a non-zero code or non-empty
    /// stderr.
    pub fn check_exit_and_stderr(self) -> Result<Self> {
        if !self.stderr.is_empty() {
            return Err(Error::ComputationExit {
                code: self.code,
                stderr: self.stderr,
            });
        }
        self.check_exit()
    }
}

// =============================================================================
// Invoker Trait
// =============================================================================

/// Callable handle to a running worker service.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    /// Transport this invoker speaks.
    fn transport(&self) -> Transport;

    /// `host:port` the worker is reached at.
    fn endpoint(&self) -> String;

    /// Runs one invocation to completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ComputationExit`] when the worker process fails,
    /// [`Error::ProtocolParse`] on malformed framing, and a connection error
    /// (see [`Error::is_connection_reset`]) when the worker hangs up.
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput>;
}

impl std::fmt::Debug for dyn ServiceInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInvoker")
            .field("transport", &self.transport())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_json() {
        let frame = ControlFrame::readiness_echo();
        let json = frame.to_json().unwrap();
        assert_eq!(json, r#"{"command":"echo","args":["test"]}"#);
        assert_eq!(ControlFrame::from_slice(json.as_bytes()).unwrap(), frame);
    }

    #[test]
    fn test_control_frame_missing_args() {
        let frame = ControlFrame::from_slice(br#"{"command":"ls"}"#).unwrap();
        assert!(frame.args.is_empty());
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["python".to_string(), "entry.py".to_string()];
        let frame = ControlFrame::from_argv(&argv).unwrap();
        assert_eq!(frame.command, "python");
        assert_eq!(frame.args, vec!["entry.py"]);
        assert!(ControlFrame::from_argv(&[]).is_err());
    }

    #[test]
    fn test_check_exit() {
        let ok = InvocationOutput {
            stdout: "{}".into(),
            stderr: "warning".into(),
            code: 0,
        };
        assert!(ok.clone().check_exit().is_ok());
        assert!(ok.check_exit_and_stderr().is_err());

        let failed = InvocationOutput {
            code: 2,
            stderr: "boom".into(),
            ..Default::default()
        };
        let err = failed.check_exit().unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert!(err.to_string().contains("exitcode 2 and stderr boom"));
    }
}
