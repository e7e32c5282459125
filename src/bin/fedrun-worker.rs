//! # fedrun-worker - Computation Worker Server
//!
//! Entrypoint of worker images. Serves one invocation per connection: spawns
//! the requested command, feeds it the request body on stdin and streams its
//! stdout, stderr and exit code back to the service manager.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Worker container                                         │
//! │  fedrun-worker '{"level":"info","server":"ws",           │
//! │                  "port":8881,"host":"0.0.0.0"}'          │
//! │  ├─► listen on host:port (http or ws)                    │
//! │  ├─► per connection: control frame → spawn → stream      │
//! │  └─► SIGINT/SIGTERM → stop accepting, exit 0             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The only argument is the JSON launch configuration. Every field is
//! optional; without an argument the worker serves WebSocket on port 8881.

use std::process::ExitCode;

use anyhow::{Context, Result};
use fedrun::logging;
use fedrun::protocol::{WorkerConfig, serve};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Exit Codes
// =============================================================================

const EXIT_SUCCESS: u8 = 0;
const EXIT_CONFIG_FAILED: u8 = 1;
const EXIT_SERVE_FAILED: u8 = 2;

// =============================================================================
// Configuration
// =============================================================================

fn load_config() -> Result<WorkerConfig> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(arg) => WorkerConfig::from_launch_arg(&arg)
            .with_context(|| format!("parsing launch argument '{arg}'"))?,
        None => WorkerConfig::default(),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument '{extra}'");
    }
    Ok(config)
}

// =============================================================================
// Signals
// =============================================================================

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fedrun-worker: {e:#}");
            return ExitCode::from(EXIT_CONFIG_FAILED);
        }
    };
    logging::try_init_worker(logging::parse_level(&config.level));

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    match serve(config, token).await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            error!(error = %e, "worker server failed");
            ExitCode::from(EXIT_SERVE_FAILED)
        }
    }
}
