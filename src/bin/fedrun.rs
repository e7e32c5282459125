//! fedrun - Pipeline Runner CLI
//!
//! Runs pipelines on the local site and manages the worker images of the
//! configured backend.
//!
//! ## Usage
//!
//! ```sh
//! fedrun run pipeline.json [--run-id <id>] [--timeout <secs>]
//! fedrun images
//! fedrun pull <image>...
//! fedrun rmi <image>...
//! fedrun prune
//! fedrun status
//! fedrun ps
//! fedrun logs <container> [--tail <n>]
//! fedrun stats
//! ```
//!
//! ## Backend Selection
//!
//! Settings come from `--config` (a JSON [`PipelineManagerConfig`]), then
//! `FEDRUN_*` environment variables, then the flags below:
//!
//! - `--backend docker|singularity`
//! - `--transport ws|http`
//! - `--debug` for verbose workers and the debug port

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fedrun::backend::{ImageOutcome, PullProgress};
use fedrun::{
    BackendKind, NoRemote, PipelineEvent, PipelineManager, PipelineManagerConfig, PipelineSpec,
    RunSpec, ServiceManager, Transport, logging,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, warn};

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "fedrun", version, about = "Run computation pipelines in worker containers")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, short, global = true, env = "FEDRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Execution backend.
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Worker transport.
    #[arg(long, global = true)]
    transport: Option<Transport>,

    /// Root of the per-run directories.
    #[arg(long, global = true)]
    operating_directory: Option<PathBuf>,

    /// Verbose logging here and inside workers.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a pipeline and print its final output.
    Run {
        /// Pipeline spec (JSON).
        pipeline: PathBuf,
        /// Run ID. Generated when omitted.
        #[arg(long)]
        run_id: Option<String>,
        /// Print progress events as JSON lines on stderr.
        #[arg(long)]
        events: bool,
        /// Fail the run after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List local images.
    Images,
    /// Pull images.
    Pull {
        #[arg(required = true)]
        images: Vec<String>,
    },
    /// Remove images.
    Rmi {
        #[arg(required = true)]
        images: Vec<String>,
    },
    /// Remove unused images.
    Prune,
    /// Check that the backend answers.
    Status,
    /// List worker containers.
    Ps,
    /// Print a container's output.
    Logs {
        container: String,
        /// Only the last N lines.
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Print resource usage of every worker container.
    Stats,
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(cli: &Cli) -> Result<PipelineManagerConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineManagerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineManagerConfig::default(),
    };
    config.manager = config
        .manager
        .with_env_overrides()
        .context("reading FEDRUN_* environment")?;
    if let Some(backend) = cli.backend {
        config.manager.backend = backend;
    }
    if let Some(transport) = cli.transport {
        config.manager.transport = transport;
    }
    if let Some(dir) = &cli.operating_directory {
        config.operating_directory = dir.clone();
    }
    if cli.debug {
        config.manager.debug = true;
    }
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_run(
    config: PipelineManagerConfig,
    pipeline: PathBuf,
    run_id: Option<String>,
    print_events: bool,
    timeout: Option<u64>,
) -> Result<()> {
    let raw = std::fs::read_to_string(&pipeline)
        .with_context(|| format!("reading {}", pipeline.display()))?;
    let spec = PipelineSpec::from_json(&raw)?;
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    let manager = PipelineManager::create(config)?;
    let run_spec = RunSpec {
        timeout,
        ..RunSpec::new(run_id, spec)
    };
    let mut run = manager.start_pipeline(run_spec, Arc::new(NoRemote))?;

    let stop = manager.clone();
    let (client_id, stop_run) = (manager.config().client_id.clone(), run.id().to_string());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(run_id = %stop_run, "interrupted, stopping pipeline");
            let _ = stop.stop_pipeline(&client_id, &stop_run);
        }
    });

    loop {
        match run.events().recv().await {
            Ok(event) => {
                if print_events {
                    eprintln!("{}", serde_json::to_string(&event)?);
                }
                if matches!(event, PipelineEvent::Finished { .. } | PipelineEvent::Failed { .. }) {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    let result = run.wait().await;
    manager.services().stop_all_services().await?;
    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_images(services: &ServiceManager) -> Result<()> {
    let images = services.get_images().await?;
    println!("{:<20} {:>12}  TAGS", "ID", "SIZE");
    for image in images {
        let id: String = image.id.trim_start_matches("sha256:").chars().take(12).collect();
        println!("{:<20} {:>12}  {}", id, image.size, image.tags.join(","));
    }
    Ok(())
}

async fn cmd_pull(services: &ServiceManager, images: &[String]) -> Result<()> {
    let progress = Arc::new(|p: &PullProgress| match &p.detail {
        Some(detail) => eprintln!("{}: {} {}", p.image, p.status, detail),
        None => eprintln!("{}: {}", p.image, p.status),
    });
    report(services.pull_images_from_list(images, progress).await, "pulled")
}

async fn cmd_rmi(services: &ServiceManager, images: &[String]) -> Result<()> {
    report(services.remove_images_from_list(images).await, "removed")
}

async fn cmd_prune(services: &ServiceManager) -> Result<()> {
    let report = services.prune_images().await?;
    for image in &report.removed {
        println!("removed {image}");
    }
    println!("reclaimed {} bytes", report.reclaimed);
    Ok(())
}

async fn cmd_status(services: &ServiceManager) -> Result<()> {
    let backend = services.backend().kind();
    if !services.get_status().await {
        bail!("{backend} backend is not reachable");
    }
    println!("{backend}: ok");
    for service in services.get_services() {
        println!("{}", serde_json::to_string(&service)?);
    }
    Ok(())
}

async fn cmd_ps(services: &ServiceManager) -> Result<()> {
    for container in services.list_containers().await? {
        println!(
            "{}\t{}\t{}\t{}",
            container.id,
            container.service_id.as_deref().unwrap_or("-"),
            container.state,
            container.image
        );
    }
    Ok(())
}

async fn cmd_logs(services: &ServiceManager, container: &str, tail: Option<usize>) -> Result<()> {
    print!("{}", services.get_container_logs(container, tail).await?);
    Ok(())
}

async fn cmd_stats(services: &ServiceManager) -> Result<()> {
    for stats in services.get_container_stats().await? {
        let cpu = stats
            .cpu_percent
            .map_or_else(|| "-".to_string(), |cpu| format!("{cpu:.1}%"));
        let memory = match (stats.memory_usage, stats.memory_limit) {
            (Some(usage), Some(limit)) => format!("{usage} / {limit}"),
            (Some(usage), None) => usage.to_string(),
            _ => "-".to_string(),
        };
        println!("{}\t{cpu}\t{memory}", stats.container_id);
    }
    Ok(())
}

fn report(outcomes: Vec<ImageOutcome>, verb: &str) -> Result<()> {
    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.error {
            None => println!("{verb} {}", outcome.image),
            Some(e) => {
                failed += 1;
                eprintln!("{}: {e}", outcome.image);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} images failed", outcomes.len());
    }
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let services = || ServiceManager::from_config(&config.manager);
    match cli.command {
        Command::Run {
            pipeline,
            run_id,
            events,
            timeout,
        } => cmd_run(config.clone(), pipeline, run_id, events, timeout).await,
        Command::Images => cmd_images(&services()?).await,
        Command::Pull { images } => cmd_pull(&services()?, &images).await,
        Command::Rmi { images } => cmd_rmi(&services()?, &images).await,
        Command::Prune => cmd_prune(&services()?).await,
        Command::Status => cmd_status(&services()?).await,
        Command::Ps => cmd_ps(&services()?).await,
        Command::Logs { container, tail } => cmd_logs(&services()?, &container, tail).await,
        Command::Stats => cmd_stats(&services()?).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::try_init(if cli.debug { Level::DEBUG } else { Level::INFO });

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
