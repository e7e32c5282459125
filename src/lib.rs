//! # fedrun
//!
//! **Computation Orchestration Engine for Decentralized Pipelines**
//!
//! This crate runs multi-step statistical pipelines whose steps execute inside
//! isolated worker containers. Decentralized steps alternate local iterations
//! with a remote aggregation round trip; the remote transport itself belongs
//! to the host application and is plugged in through [`RemoteHandler`].
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              fedrun                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     PipelineManager                         │    │
//! │  │   start_pipeline(run) → PipelineRun { events, wait() }      │    │
//! │  │   stop_pipeline(client, run)                                │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │   Pipeline ─► Controller (control box loop) ─► Computation │      │
//! │  │   Local │ Decentralized │ RemoteHandler round trips        │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                    ServiceManager                         │      │
//! │  │  Single-flight start │ Port ledger │ Refcounted stop      │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├──────────────────────────────┼──────────────────────────────────────┤
//! │          Backends            │          Worker Protocol             │
//! │  ┌──────────────┐ ┌────────────────┐  ┌──────────────────────────┐  │
//! │  │DockerBackend │ │SingularityBackend│ │ HTTP chunked + sentinels │  │
//! │  │  (bollard)   │ │  (instance CLI) │  │ WebSocket JSON events    │  │
//! │  └──────────────┘ └────────────────┘  └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Service Lifecycle
//!
//! ```text
//!   ┌─────────┐  start   ┌──────────┐  ready   ┌─────────┐
//!   │ (none)  │ ───────► │ Starting │ ───────► │ Running │
//!   └─────────┘          └──────────┘          └────┬────┘
//!        ▲                                          │ last user leaves
//!        │ stopped                                  ▼
//!        │                                   ┌──────────────┐  stop fails  ┌────────┐
//!        └────────────────────────────────── │ ShuttingDown │ ───────────► │ Zombie │
//!                                            └──────────────┘              └────────┘
//! ```
//!
//! # Worker Wire Format
//!
//! Worker images run `fedrun-worker` (or a compatible server) and speak one
//! of two transports. Both carry a control frame `{"command", "args"}`
//! followed by stdin; the HTTP response multiplexes output with literal
//! sentinel markers:
//!
//! ```text
//! stdoutSTART\n ... stdoutEND\n
//! stderrSTART\n ... stderrEND\n
//! exitcodeSTART\n 0 exitcodeEND\n
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fedrun::{NoRemote, PipelineManager, PipelineManagerConfig, PipelineSpec, RunSpec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fedrun::Result<()> {
//!     let manager = PipelineManager::create(PipelineManagerConfig::default())?;
//!     let spec = PipelineSpec::from_json(&std::fs::read_to_string("pipeline.json")?)?;
//!     let run = manager.start_pipeline(RunSpec::new("run-1", spec), Arc::new(NoRemote))?;
//!     println!("{}", run.wait().await?);
//!     manager.services().stop_all_services().await
//! }
//! ```

pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod protocol;
pub mod service;

// Re-exports
pub use backend::{
    ContainerHandle, ContainerInfo, ContainerStats, DockerBackend, ImageInfo, Mount,
    ServiceBackend, ServiceOptions, SingularityBackend,
};
pub use config::{BackendKind, ManagerConfig, OperatingMode, PipelineManagerConfig, Transport};
pub use constants::*;
pub use error::{Error, Result};
pub use pipeline::{
    NoRemote, Pipeline, PipelineEvent, PipelineManager, PipelineRun, PipelineSpec,
    RemoteHandler, RoundCollector, RunSpec,
};
pub use protocol::{ControlFrame, Invocation, InvocationOutput, ServiceInvoker};
pub use service::{ServiceManager, ServiceSnapshot, ServiceState};
