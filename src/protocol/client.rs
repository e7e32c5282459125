//! Host-side invokers for worker services.
//!
//! Each invocation opens a fresh connection to the worker, sends the control
//! frame and stdin, and decodes the response. The invokers are cheap to clone
//! and hold no connection state between calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use fedrun::protocol::{ControlFrame, HttpInvoker, Invocation, ServiceInvoker};
//! use std::time::Duration;
//!
//! let invoker = HttpInvoker::new("127.0.0.1", 8101)
//!     .with_timeout(Duration::from_secs(600));
//!
//! let output = invoker
//!     .invoke(Invocation::new(ControlFrame::readiness_echo()))
//!     .await?;
//! assert_eq!(output.stdout, "test\n");
//! ```

use super::http::{self, ResponseDecoder};
use super::ws::{WsAccumulator, WsEvent};
use super::{Invocation, InvocationOutput, ServiceInvoker};
use crate::config::Transport;
use crate::constants::{
    INPUT_CHUNK_SIZE, IO_BUFFER_SIZE, WORKER_CONNECT_TIMEOUT, WS_CONNECT_BACKOFF,
    WS_CONNECT_RETRIES,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

/// Builds the invoker for `transport` at `host:port`.
#[must_use]
pub fn connect_invoker(transport: Transport, host: &str, port: u16) -> Arc<dyn ServiceInvoker> {
    match transport {
        Transport::Http => Arc::new(HttpInvoker::new(host, port)),
        Transport::Ws => Arc::new(WsInvoker::new(host, port)),
    }
}

async fn with_deadline<T>(
    limit: Option<Duration>,
    operation: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(duration) => timeout(duration, fut).await.map_err(|_| Error::Timeout {
            operation: operation.to_string(),
            duration,
        })?,
        None => fut.await,
    }
}

// =============================================================================
// HTTP Invoker
// =============================================================================

/// Invoker speaking the chunked HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    host: String,
    port: u16,
    connect_timeout: Duration,
    timeout: Option<Duration>,
}

impl HttpInvoker {
    /// Creates an invoker for `host:port` with no overall deadline.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: WORKER_CONNECT_TIMEOUT,
            timeout: None,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets a deadline for a whole invocation.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    async fn exchange(&self, invocation: &Invocation) -> Result<InvocationOutput> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("connect to worker at {}", self.endpoint()),
            duration: self.connect_timeout,
        })??;
        stream.set_nodelay(true)?;

        let request = http::encode_request(
            &self.endpoint(),
            &invocation.control,
            &invocation.input,
        )?;
        let (mut reader, mut writer) = stream.into_split();

        // Stdin and output flow at the same time so a worker that answers
        // before draining its input cannot deadlock the exchange.
        let write = async move {
            writer.write_all(&request).await?;
            writer.flush().await?;
            Ok::<_, Error>(writer)
        };
        let read = async move {
            let mut decoder = ResponseDecoder::new();
            let mut buf = vec![0u8; IO_BUFFER_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                decoder.feed(&buf[..n])?;
                if decoder.is_complete() {
                    break;
                }
            }
            debug!(bytes = decoder.bytes_received(), "worker response received");
            decoder.finish()
        };

        let (_writer, output) = tokio::try_join!(write, read)?;
        Ok(output)
    }
}

#[async_trait]
impl ServiceInvoker for HttpInvoker {
    fn transport(&self) -> Transport {
        Transport::Http
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput> {
        debug!(
            endpoint = %self.endpoint(),
            command = %invocation.control.command,
            input_bytes = invocation.input.len(),
            "invoking worker over http"
        );
        let output =
            with_deadline(self.timeout, "worker invocation", self.exchange(&invocation)).await?;
        output.check_exit_and_stderr()
    }
}

// =============================================================================
// WebSocket Invoker
// =============================================================================

/// Invoker speaking the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsInvoker {
    host: String,
    port: u16,
    connect_timeout: Duration,
    timeout: Option<Duration>,
    connect_retries: u32,
}

impl WsInvoker {
    /// Creates an invoker for `host:port` with no overall deadline.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: WORKER_CONNECT_TIMEOUT,
            timeout: None,
            connect_retries: WS_CONNECT_RETRIES,
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets a deadline for a whole invocation.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets how many refused or reset connects are retried.
    #[must_use]
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Connects, retrying while the worker is not listening yet.
    async fn connect(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    > {
        let url = self.url();
        let mut attempt = 0;
        loop {
            let result = timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| Error::Timeout {
                    operation: format!("connect to worker at {url}"),
                    duration: self.connect_timeout,
                })?;
            match result {
                Ok((socket, _)) => return Ok(socket),
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_connection_reset() || attempt >= self.connect_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    debug!(url = %url, attempt, error = %err, "worker not accepting yet, retrying");
                    tokio::time::sleep(WS_CONNECT_BACKOFF * attempt).await;
                }
            }
        }
    }

    async fn exchange(&self, invocation: &Invocation) -> Result<InvocationOutput> {
        let socket = self.connect().await?;
        let (mut sink, mut source) = socket.split();
        let control = invocation.control.to_json()?;
        let input = invocation.input.clone();

        let write = async {
            sink.send(Message::Text(control.into())).await?;
            let mut start = 0;
            while start < input.len() {
                let end = (start + INPUT_CHUNK_SIZE).min(input.len());
                sink.send(Message::Binary(input.slice(start..end))).await?;
                start = end;
            }
            // Empty binary message closes the process's stdin.
            sink.send(Message::Binary(bytes::Bytes::new())).await?;
            Ok::<_, Error>(())
        };
        let read = async {
            let mut acc = WsAccumulator::new();
            while let Some(message) = source.next().await {
                match message? {
                    Message::Text(text) => {
                        if let Some(output) = acc.feed(WsEvent::from_json(text.as_str())?)? {
                            return Ok(output);
                        }
                    }
                    Message::Close(frame) => {
                        let reason = frame.map(|f| format!("{} {}", f.code, f.reason.as_str()));
                        return Err(Error::ConnectionClosed(format!(
                            "worker closed websocket before exit: {}",
                            reason.unwrap_or_else(|| "no close frame".to_string())
                        )));
                    }
                    _ => {}
                }
            }
            Err(Error::ConnectionClosed(
                "worker websocket ended before exit".to_string(),
            ))
        };

        let ((), output) = tokio::try_join!(write, read)?;
        let close = CloseFrame {
            code: CloseCode::Normal,
            reason: "Normal Client disconnect".into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(close))).await {
            debug!(error = %e, "websocket close after completion failed");
        }
        Ok(output)
    }
}

#[async_trait]
impl ServiceInvoker for WsInvoker {
    fn transport(&self) -> Transport {
        Transport::Ws
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput> {
        debug!(
            endpoint = %self.endpoint(),
            command = %invocation.control.command,
            input_bytes = invocation.input.len(),
            "invoking worker over websocket"
        );
        let output =
            with_deadline(self.timeout, "worker invocation", self.exchange(&invocation)).await?;
        output.check_exit()
    }
}
