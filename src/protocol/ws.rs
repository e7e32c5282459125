//! WebSocket transport messages.
//!
//! The worker sends one JSON text message per process event. The client folds
//! them into an [`InvocationOutput`] with [`WsAccumulator`].

use super::{InvocationOutput, NO_EXIT_CODE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event sent by the worker over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsEvent {
    /// Stdout data, or the end-of-stream marker when `end` is true.
    Stdout {
        /// Data read from the pipe.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        /// Stream closed.
        #[serde(default)]
        end: bool,
    },
    /// Stderr data, or the end-of-stream marker when `end` is true.
    Stderr {
        /// Data read from the pipe.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        /// Stream closed.
        #[serde(default)]
        end: bool,
    },
    /// Process exited. `None` when killed by a signal.
    Close {
        /// Exit code.
        code: Option<i32>,
    },
    /// Process could not be spawned.
    Error {
        /// Spawn error: a message string or a serialized error object.
        error: Value,
    },
}

impl WsEvent {
    /// Stdout data event.
    #[must_use]
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout {
            data: Some(data.into()),
            end: false,
        }
    }

    /// Stderr data event.
    #[must_use]
    pub fn stderr(data: impl Into<String>) -> Self {
        Self::Stderr {
            data: Some(data.into()),
            end: false,
        }
    }

    /// Spawn error event carrying `message`.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: Value::String(message.into()),
        }
    }

    /// Serializes to JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] on anything that is not a worker event.
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s.trim())
            .map_err(|e| Error::ProtocolParse(format!("invalid worker event: {e}")))
    }
}

/// Folds worker events into an invocation result.
///
/// The result is ready once the exit code arrived and stdout has ended; a
/// trailing stderr end marker is not awaited. A non-zero exit code or a spawn
/// error fails immediately, whatever else is outstanding.
#[derive(Debug, Default)]
pub struct WsAccumulator {
    stdout: String,
    stderr: String,
    stdout_end: bool,
    stderr_end: bool,
    code: Option<i32>,
}

impl WsAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event. Returns the output once it is complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ComputationExit`] on a non-zero exit code or a spawn
    /// error.
    pub fn feed(&mut self, event: WsEvent) -> Result<Option<InvocationOutput>> {
        match event {
            WsEvent::Stdout { data, end } => {
                if let Some(data) = data {
                    self.stdout.push_str(&data);
                }
                self.stdout_end |= end;
            }
            WsEvent::Stderr { data, end } => {
                if let Some(data) = data {
                    self.stderr.push_str(&data);
                }
                self.stderr_end |= end;
            }
            WsEvent::Close { code } => {
                let code = code.unwrap_or(NO_EXIT_CODE);
                if code != 0 {
                    return Err(Error::ComputationExit {
                        code,
                        stderr: std::mem::take(&mut self.stderr),
                    });
                }
                self.code = Some(code);
            }
            WsEvent::Error { error } => {
                return Err(Error::ComputationExit {
                    code: NO_EXIT_CODE,
                    stderr: render_error(&error),
                });
            }
        }
        Ok(self.ready())
    }

    fn ready(&mut self) -> Option<InvocationOutput> {
        let code = self.code?;
        if !self.stdout_end {
            return None;
        }
        Some(InvocationOutput {
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
            code,
        })
    }

    /// Returns true once both output streams reported their end.
    #[must_use]
    pub fn streams_ended(&self) -> bool {
        self.stdout_end && self.stderr_end
    }
}

/// Text of a worker spawn error.
///
/// Node-style error objects carry `message` and `code`; other shapes are
/// rendered as compact JSON.
fn render_error(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(fields) => {
            let text = |key: &str| fields.get(key).and_then(Value::as_str);
            match (text("message"), text("code")) {
                (Some(message), _) => message.to_string(),
                (None, Some(code)) => code.to_string(),
                (None, None) => error.to_string(),
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = WsEvent::stdout("hi").to_json().unwrap();
        assert_eq!(json, r#"{"type":"stdout","data":"hi","end":false}"#);

        let json = WsEvent::Stdout {
            data: None,
            end: true,
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"stdout","end":true}"#);

        let json = WsEvent::Close { code: Some(0) }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"close","code":0}"#);
    }

    #[test]
    fn test_parse_null_code() {
        let event = WsEvent::from_json(r#"{"type":"close","code":null}"#).unwrap();
        assert_eq!(event, WsEvent::Close { code: None });
    }

    #[test]
    fn test_accumulate_in_order() {
        let mut acc = WsAccumulator::new();
        assert!(acc.feed(WsEvent::stdout("O")).unwrap().is_none());
        assert!(acc.feed(WsEvent::stdout("K")).unwrap().is_none());
        assert!(
            acc.feed(WsEvent::Stdout {
                data: None,
                end: true
            })
            .unwrap()
            .is_none()
        );
        let out = acc
            .feed(WsEvent::Close { code: Some(0) })
            .unwrap()
            .unwrap();
        assert_eq!(out.stdout, "OK");
        assert_eq!(out.code, 0);
    }

    #[test]
    fn test_waits_for_stdout_end_after_close() {
        let mut acc = WsAccumulator::new();
        acc.feed(WsEvent::stdout("x")).unwrap();
        assert!(acc.feed(WsEvent::Close { code: Some(0) }).unwrap().is_none());
        let out = acc
            .feed(WsEvent::Stdout {
                data: None,
                end: true,
            })
            .unwrap()
            .unwrap();
        assert_eq!(out.stdout, "x");
    }

    #[test]
    fn test_nonzero_code_short_circuits() {
        let mut acc = WsAccumulator::new();
        acc.feed(WsEvent::stderr("Traceback")).unwrap();
        let err = acc.feed(WsEvent::Close { code: Some(1) }).unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert!(err.to_string().contains("Traceback"));
    }

    #[test]
    fn test_spawn_error() {
        let mut acc = WsAccumulator::new();
        let err = acc
            .feed(WsEvent::error("spawn python ENOENT"))
            .unwrap_err();
        assert!(matches!(err, Error::ComputationExit { .. }));
    }

    #[test]
    fn test_spawn_error_object() {
        let event =
            WsEvent::from_json(r#"{"type":"error","error":{"code":"ENOENT","errno":-2}}"#).unwrap();
        let err = WsAccumulator::new().feed(event).unwrap_err();
        match err {
            Error::ComputationExit { code, stderr } => {
                assert_eq!(code, NO_EXIT_CODE);
                assert_eq!(stderr, "ENOENT");
            }
            other => panic!("expected computation failure, got {other:?}"),
        }

        let event = WsEvent::from_json(
            r#"{"type":"error","error":{"message":"spawn python ENOENT","code":"ENOENT"}}"#,
        )
        .unwrap();
        let err = WsAccumulator::new().feed(event).unwrap_err();
        assert!(err.to_string().contains("spawn python ENOENT"));
    }
}
