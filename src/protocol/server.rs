//! Worker server running inside computation containers.
//!
//! The server accepts one invocation per connection, spawns the requested
//! process, pipes the request's stdin into it and streams stdout, stderr and
//! the exit code back in the transport's framing.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Worker container                                             │
//! │                                                              │
//! │  accept ──► decode control ──► spawn process                 │
//! │                                  │  ▲ stdin task             │
//! │                                  ▼  │                        │
//! │            ProcessEvent channel: Data / End / Exit           │
//! │                                  │                           │
//! │                                  ▼                           │
//! │          encode (sentinel chunks or JSON text frames)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use super::http::{self, RequestDecoder, RequestEvent, Segment};
use super::ws::WsEvent;
use super::ControlFrame;
use crate::config::Transport;
use crate::constants::{IO_BUFFER_SIZE, WORKER_CONTAINER_PORT, WS_CLOSE_GRACE};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Launch Configuration
// =============================================================================

/// Launch configuration passed to the worker as its single JSON argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Log level name.
    pub level: String,
    /// Transport to serve.
    pub server: Transport,
    /// Port to listen on.
    pub port: u16,
    /// Address to bind.
    pub host: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            server: Transport::Ws,
            port: WORKER_CONTAINER_PORT,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Parses the JSON launch argument, e.g.
    /// `{"level":"debug","server":"ws","port":8881}`.
    ///
    /// # Errors
    ///
    /// Returns error if the argument is not a valid launch configuration.
    pub fn from_launch_arg(arg: &str) -> Result<Self> {
        serde_json::from_str(arg.trim())
            .map_err(|e| Error::Config(format!("invalid worker launch argument: {e}")))
    }

    /// Serializes to the JSON launch argument.
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_launch_arg(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Accept Loop
// =============================================================================

/// Binds the configured address and serves until `shutdown` fires.
///
/// # Errors
///
/// Returns error if the listener cannot be bound.
pub async fn serve(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    serve_listener(listener, config.server, shutdown).await
}

/// Serves `transport` on an already bound listener until `shutdown` fires.
///
/// # Errors
///
/// Returns error only if the listener address cannot be read.
pub async fn serve_listener(
    listener: TcpListener,
    transport: Transport,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, transport = %transport, "worker server listening");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("worker server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "connection accepted");
                        tokio::spawn(async move {
                            let result = match transport {
                                Transport::Http => handle_http(stream).await,
                                Transport::Ws => handle_ws(stream).await,
                            };
                            if let Err(e) = result {
                                warn!(peer = %peer, error = %e, "invocation failed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Process Plumbing
// =============================================================================

/// Output pipe of the spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipe {
    Stdout,
    Stderr,
}

/// Event emitted by a running process. `Exit` is sent after both pipes
/// reported `End`.
#[derive(Debug)]
enum ProcessEvent {
    Data(Pipe, Bytes),
    End(Pipe),
    Exit(Option<i32>),
}

struct RunningProcess {
    stdin: Option<ChildStdin>,
    events: mpsc::Receiver<ProcessEvent>,
}

fn spawn_process(control: &ControlFrame, with_stdin: bool) -> Result<RunningProcess> {
    let mut cmd = Command::new(&control.command);
    cmd.args(&control.args)
        .stdin(if with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("child stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("child stderr not captured".to_string()))?;

    let (tx, rx) = mpsc::channel(64);
    let out_task = tokio::spawn(pump_pipe(stdout, Pipe::Stdout, tx.clone()));
    let err_task = tokio::spawn(pump_pipe(stderr, Pipe::Stderr, tx.clone()));
    let command = control.command.clone();
    tokio::spawn(async move {
        let _ = out_task.await;
        let _ = err_task.await;
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!(command = %command, error = %e, "waiting on process failed");
                None
            }
        };
        if code != Some(0) {
            warn!(command = %command, code = ?code, "process exited with failure");
        }
        let _ = tx.send(ProcessEvent::Exit(code)).await;
    });

    Ok(RunningProcess { stdin, events: rx })
}

async fn pump_pipe<R: AsyncRead + Unpin>(mut pipe: R, which: Pipe, tx: mpsc::Sender<ProcessEvent>) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(ProcessEvent::Data(which, data)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(pipe = ?which, error = %e, "pipe read failed");
                break;
            }
        }
    }
    let _ = tx.send(ProcessEvent::End(which)).await;
}

/// Forwards stdin chunks to the child on its own task; `None` closes stdin.
fn spawn_stdin_writer(stdin: Option<ChildStdin>) -> mpsc::UnboundedSender<Option<Bytes>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<Bytes>>();
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(message) = rx.recv().await {
            match message {
                Some(data) => {
                    if let Some(pipe) = stdin.as_mut() {
                        if let Err(e) = pipe.write_all(&data).await {
                            debug!(error = %e, "process stopped reading stdin");
                            stdin = None;
                        }
                    }
                }
                None => {
                    stdin = None;
                }
            }
        }
    });
    tx
}

/// Decodes UTF-8 across read boundaries, holding back an incomplete trailing
/// sequence until the next read.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(valid);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

// =============================================================================
// HTTP Handler
// =============================================================================

async fn handle_http(stream: TcpStream) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = RequestDecoder::new();
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    let mut events = Vec::new();

    let (control, streaming) = loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed(
                "client closed before sending a control frame".to_string(),
            ));
        }
        decoder.feed(&buf[..n], &mut events)?;
        if let Some(pos) = events
            .iter()
            .position(|e| matches!(e, RequestEvent::Control { .. }))
        {
            if let RequestEvent::Control { frame, streaming } = events.remove(pos) {
                break (frame, streaming);
            }
        }
    };
    debug!(command = %control.command, args = ?control.args, streaming, "control frame received");

    let mut process = match spawn_process(&control, streaming) {
        Ok(process) => process,
        Err(e) => {
            error!(command = %control.command, error = %e, "process failed to start");
            let mut out = http::response_head();
            http::encode_segment(&mut out, Segment::Stderr, e.to_string().as_bytes());
            out.extend_from_slice(http::LAST_CHUNK);
            writer.write_all(&out).await?;
            writer.shutdown().await?;
            return Ok(());
        }
    };

    if streaming {
        let stdin_tx = spawn_stdin_writer(process.stdin.take());
        tokio::spawn(async move {
            let mut events = events;
            let mut buf = buf;
            loop {
                for event in events.drain(..) {
                    match event {
                        RequestEvent::Stdin(data) => {
                            let _ = stdin_tx.send(Some(data));
                        }
                        RequestEvent::StdinEnd => {
                            let _ = stdin_tx.send(None);
                        }
                        RequestEvent::Control { .. } => {}
                    }
                }
                if decoder.is_done() {
                    return;
                }
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        let _ = stdin_tx.send(None);
                        return;
                    }
                    Ok(n) => {
                        if let Err(e) = decoder.feed(&buf[..n], &mut events) {
                            warn!(error = %e, "malformed stdin stream");
                            let _ = stdin_tx.send(None);
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "request stream read failed");
                        let _ = stdin_tx.send(None);
                        return;
                    }
                }
            }
        });
    }

    writer.write_all(&http::response_head()).await?;
    while let Some(event) = process.events.recv().await {
        let mut out = Vec::new();
        match event {
            ProcessEvent::Data(Pipe::Stdout, data) => {
                http::encode_segment(&mut out, Segment::Stdout, &data);
            }
            ProcessEvent::Data(Pipe::Stderr, data) => {
                http::encode_segment(&mut out, Segment::Stderr, &data);
            }
            ProcessEvent::End(_) => continue,
            ProcessEvent::Exit(code) => {
                http::encode_exit(&mut out, code);
                writer.write_all(&out).await?;
                break;
            }
        }
        writer.write_all(&out).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

// =============================================================================
// WebSocket Handler
// =============================================================================

async fn handle_ws(stream: TcpStream) -> Result<()> {
    let socket = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = socket.split();

    let control = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => break ControlFrame::from_slice(text.as_str().as_bytes())?,
            Some(Ok(Message::Binary(data))) => break ControlFrame::from_slice(&data)?,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };
    debug!(command = %control.command, args = ?control.args, "control frame received");

    let mut process = match spawn_process(&control, true) {
        Ok(process) => process,
        Err(e) => {
            error!(command = %control.command, error = %e, "process failed to start");
            let event = WsEvent::error(e.to_string());
            sink.send(Message::Text(event.to_json()?.into())).await?;
            return Ok(());
        }
    };

    let stdin_tx = spawn_stdin_writer(process.stdin.take());
    let mut stdout_text = Utf8Carry::default();
    let mut stderr_text = Utf8Carry::default();
    let mut client_open = true;

    loop {
        tokio::select! {
            message = source.next(), if client_open => {
                match message {
                    Some(Ok(Message::Binary(data))) if data.is_empty() => {
                        let _ = stdin_tx.send(None);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = stdin_tx.send(Some(data));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = stdin_tx.send(Some(Bytes::copy_from_slice(text.as_str().as_bytes())));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "client stream failed");
                        client_open = false;
                        let _ = stdin_tx.send(None);
                    }
                    None => {
                        client_open = false;
                        let _ = stdin_tx.send(None);
                    }
                }
            }
            event = process.events.recv() => {
                let Some(event) = event else { break };
                let outgoing = match event {
                    ProcessEvent::Data(Pipe::Stdout, data) => vec![WsEvent::stdout(stdout_text.push(&data))],
                    ProcessEvent::Data(Pipe::Stderr, data) => vec![WsEvent::stderr(stderr_text.push(&data))],
                    ProcessEvent::End(Pipe::Stdout) => {
                        let mut out: Vec<WsEvent> = stdout_text.finish().into_iter().map(WsEvent::stdout).collect();
                        out.push(WsEvent::Stdout { data: None, end: true });
                        out
                    }
                    ProcessEvent::End(Pipe::Stderr) => {
                        let mut out: Vec<WsEvent> = stderr_text.finish().into_iter().map(WsEvent::stderr).collect();
                        out.push(WsEvent::Stderr { data: None, end: true });
                        out
                    }
                    ProcessEvent::Exit(code) => vec![WsEvent::Close { code }],
                };
                let exited = outgoing.iter().any(|e| matches!(e, WsEvent::Close { .. }));
                for event in outgoing {
                    if let WsEvent::Stdout { data: Some(d), .. } | WsEvent::Stderr { data: Some(d), .. } = &event {
                        if d.is_empty() {
                            continue;
                        }
                    }
                    sink.send(Message::Text(event.to_json()?.into())).await?;
                }
                if exited {
                    break;
                }
            }
        }
    }

    // Let the client close the session; it does so once it has the exit code.
    if client_open {
        let _ = tokio::time::timeout(WS_CLOSE_GRACE, async {
            while let Some(Ok(message)) = source.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_arg() {
        let cfg = WorkerConfig::from_launch_arg(r#"{"level":"debug","server":"http","port":9000}"#)
            .unwrap();
        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.server, Transport::Http);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.host, "0.0.0.0");

        let cfg = WorkerConfig::from_launch_arg("{}").unwrap();
        assert_eq!(cfg.port, 8881);
        assert!(WorkerConfig::from_launch_arg("not json").is_err());
    }

    #[test]
    fn test_utf8_carry_split_codepoint() {
        let mut carry = Utf8Carry::default();
        let bytes = "héllo".as_bytes();
        let first = carry.push(&bytes[..2]);
        assert_eq!(first, "h");
        let rest = carry.push(&bytes[2..]);
        assert_eq!(rest, "éllo");
        assert!(carry.finish().is_none());
    }
}
