//! Singularity backend.
//!
//! Drives the `singularity` CLI. Instances share the host network namespace,
//! so the worker is told to listen on the service port itself. Images are
//! SIF files in the configured image directory, named after the Docker
//! reference with `/` replaced by `_`:
//!
//! ```text
//!   org/comp:latest  ──build──►  <image_directory>/org_comp.sif
//!   org/comp:v2      ──build──►  <image_directory>/org_comp_v2.sif
//! ```

use super::{
    worker_log_level, ContainerHandle, ContainerInfo, CreatedService, ImageInfo, ProgressFn,
    PruneReport, PullProgress, ServiceBackend, ServiceOptions,
};
use crate::config::{BackendKind, ManagerConfig, Transport};
use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_COMMAND_OUTPUT, SINGULARITY_COMMAND_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{connect_invoker, WorkerConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// SIF file extension.
const SIF_EXTENSION: &str = "sif";

/// Local file stem for a Docker image reference.
#[must_use]
pub fn local_image_name(image: &str) -> String {
    image
        .strip_suffix(":latest")
        .unwrap_or(image)
        .replace('/', "_")
        .replace(':', "_")
}

/// Runs the `singularity` binary with a timeout and bounded output.
#[derive(Debug, Clone)]
struct SingularityCli {
    binary: String,
}

impl SingularityCli {
    async fn run(&self, args: &[String], timeout_dur: Duration) -> Result<std::process::Output> {
        debug!("singularity command: {} {}", self.binary, args.join(" "));

        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut output = timeout(timeout_dur, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("singularity {}", args.first().map_or("", String::as_str)),
                duration: timeout_dur,
            })?
            .map_err(|e| Error::BackendUnavailable {
                backend: "singularity".to_string(),
                reason: e.to_string(),
            })?;

        if output.stdout.len() > MAX_COMMAND_OUTPUT {
            output.stdout.truncate(MAX_COMMAND_OUTPUT);
            warn!("singularity stdout truncated to {} bytes", MAX_COMMAND_OUTPUT);
        }
        if output.stderr.len() > MAX_COMMAND_OUTPUT {
            output.stderr.truncate(MAX_COMMAND_OUTPUT);
            warn!("singularity stderr truncated to {} bytes", MAX_COMMAND_OUTPUT);
        }

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<serde_json::Value>,
}

fn instance_info(instance: &serde_json::Value) -> Option<ContainerInfo> {
    let name = instance["instance"].as_str()?;
    Some(ContainerInfo {
        id: name.to_string(),
        name: name.to_string(),
        image: instance["img"].as_str().unwrap_or_default().to_string(),
        state: "running".to_string(),
        service_id: Some(name.to_string()),
        created: None,
    })
}

/// Last `n` lines of `text`.
fn tail_lines(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    match trimmed.rmatch_indices('\n').nth(n - 1) {
        Some((index, _)) => &text[index + 1..],
        None => text,
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Backend driving the `singularity` CLI.
#[derive(Debug, Clone)]
pub struct SingularityBackend {
    cli: SingularityCli,
    image_directory: PathBuf,
    host: String,
    transport: Transport,
    debug: bool,
}

impl SingularityBackend {
    /// Creates the backend from the manager configuration.
    #[must_use]
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            cli: SingularityCli {
                binary: "singularity".to_string(),
            },
            image_directory: config.image_directory.clone(),
            host: config.host.clone(),
            transport: config.transport,
            debug: config.debug,
        }
    }

    /// Uses a different CLI binary, e.g. `apptainer`.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.cli.binary = binary.into();
        self
    }

    /// Returns the image directory.
    #[must_use]
    pub fn image_directory(&self) -> &Path {
        &self.image_directory
    }

    /// Path an image is built to.
    #[must_use]
    pub fn image_path(&self, image: &str) -> PathBuf {
        self.image_directory
            .join(format!("{}.{SIF_EXTENSION}", local_image_name(image)))
    }

    async fn find_image_file(&self, image: &str) -> Result<PathBuf> {
        let path = self.image_path(image);
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(Error::ImageNotFound(format!(
                "no singularity image for {image} in {}",
                self.image_directory.display()
            )))
        }
    }

    /// Arguments of `singularity instance start` for one service.
    pub(crate) fn start_args(
        &self,
        image_file: &Path,
        service_id: &str,
        port: u16,
        opts: &ServiceOptions,
    ) -> Result<Vec<String>> {
        let launch = WorkerConfig {
            level: worker_log_level(self.debug).to_string(),
            server: self.transport,
            port,
            host: self.host.clone(),
        }
        .to_launch_arg()?;

        let mut args = vec![
            "instance".to_string(),
            "start".to_string(),
            "--containall".to_string(),
        ];
        if !opts.mounts.is_empty() {
            let binds: Vec<String> = opts.mounts.iter().map(|m| m.to_bind_spec()).collect();
            args.push("-B".to_string());
            args.push(binds.join(","));
        }
        for env in &opts.env {
            args.push("--env".to_string());
            args.push(env.clone());
        }
        args.push(image_file.display().to_string());
        args.push(service_id.to_string());
        args.extend(opts.worker_command.iter().cloned());
        args.push(launch);
        Ok(args)
    }

    async fn instances(&self, name: Option<&str>) -> Result<Vec<serde_json::Value>> {
        let mut args = vec![
            "instance".to_string(),
            "list".to_string(),
            "--json".to_string(),
        ];
        args.extend(name.map(str::to_string));
        let output = self.cli.run(&args, SINGULARITY_COMMAND_TIMEOUT).await?;
        let list: InstanceList = serde_json::from_slice(&output.stdout)?;
        Ok(list.instances)
    }

    async fn image_info(path: &Path) -> Result<ImageInfo> {
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ImageInfo {
            id: name,
            tags: vec![stem],
            size: metadata.len(),
            created: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

#[async_trait]
impl ServiceBackend for SingularityBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Singularity
    }

    async fn create_service(
        &self,
        service_id: &str,
        port: u16,
        opts: &ServiceOptions,
    ) -> Result<CreatedService> {
        let image_file = self.find_image_file(&opts.image).await?;
        let args = self.start_args(&image_file, service_id, port, opts)?;
        self.cli.run(&args, SINGULARITY_COMMAND_TIMEOUT).await?;
        info!(service_id, port, "singularity instance started");

        Ok(CreatedService {
            invoker: connect_invoker(self.transport, &self.host, port),
            container: Arc::new(SingularityInstance {
                cli: self.cli.clone(),
                name: service_id.to_string(),
            }),
        })
    }

    async fn pull(&self, image: &str, progress: ProgressFn) -> Result<()> {
        let target = self.image_path(image);
        let report = |status: &str| {
            progress(&PullProgress {
                image: image.to_string(),
                status: status.to_string(),
                detail: None,
            });
        };
        if tokio::fs::try_exists(&target).await? {
            report("Image already downloaded");
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.image_directory)
            .await
            .map_err(|e| Error::DirectoryFailed {
                path: self.image_directory.clone(),
                reason: e.to_string(),
            })?;

        report("Converting docker image");
        let args = vec![
            "build".to_string(),
            "--force".to_string(),
            target.display().to_string(),
            format!("docker://{image}"),
        ];
        self.cli.run(&args, IMAGE_PULL_TIMEOUT).await?;
        report("Conversion complete");
        Ok(())
    }

    async fn get_image(&self, image: &str) -> Result<ImageInfo> {
        let path = self.find_image_file(image).await?;
        Self::image_info(&path).await
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.image_directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut images = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SIF_EXTENSION) {
                images.push(Self::image_info(&path).await?);
            }
        }
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let path = self.find_image_file(image).await?;
        tokio::fs::remove_file(&path).await?;
        debug!(image, path = %path.display(), "singularity image removed");
        Ok(())
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        let args = vec!["cache".to_string(), "clean".to_string(), "--force".to_string()];
        self.cli.run(&args, SINGULARITY_COMMAND_TIMEOUT).await?;
        Ok(PruneReport::default())
    }

    /// Every running instance; instances carry no labels, so ones not
    /// started by fedrun are listed too.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .instances(None)
            .await?
            .iter()
            .filter_map(instance_info)
            .collect())
    }

    /// Reads the instance's stdout and stderr log files.
    async fn container_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        let instances = self.instances(Some(container_id)).await?;
        let instance = instances
            .first()
            .ok_or_else(|| Error::ServiceNotFound(container_id.to_string()))?;
        let mut logs = String::new();
        for key in ["logOutPath", "logErrPath"] {
            let Some(path) = instance[key].as_str().filter(|p| !p.is_empty()) else {
                continue;
            };
            match tokio::fs::read_to_string(path).await {
                Ok(text) => logs.push_str(&text),
                Err(e) => debug!(container_id, path, error = %e, "instance log unreadable"),
            }
        }
        Ok(match tail {
            Some(n) => tail_lines(&logs, n).to_string(),
            None => logs,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.cli
            .run(&["--version".to_string()], SINGULARITY_COMMAND_TIMEOUT)
            .await
            .map_err(|e| Error::BackendUnavailable {
                backend: "singularity".to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

// =============================================================================
// Instance Handle
// =============================================================================

struct SingularityInstance {
    cli: SingularityCli,
    name: String,
}

#[async_trait]
impl ContainerHandle for SingularityInstance {
    fn id(&self) -> &str {
        &self.name
    }

    async fn is_running(&self) -> Result<bool> {
        let args = vec![
            "instance".to_string(),
            "list".to_string(),
            "--json".to_string(),
            self.name.clone(),
        ];
        let output = self.cli.run(&args, SINGULARITY_COMMAND_TIMEOUT).await?;
        let list: InstanceList = serde_json::from_slice(&output.stdout)?;
        Ok(!list.instances.is_empty())
    }

    async fn stop(&self) -> Result<()> {
        let args = vec![
            "instance".to_string(),
            "stop".to_string(),
            self.name.clone(),
        ];
        self.cli.run(&args, SINGULARITY_COMMAND_TIMEOUT).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Mount;

    fn backend(dir: &Path) -> SingularityBackend {
        let config = ManagerConfig {
            backend: BackendKind::Singularity,
            image_directory: dir.to_path_buf(),
            ..ManagerConfig::default()
        };
        SingularityBackend::new(&config)
    }

    #[test]
    fn test_local_image_name() {
        assert_eq!(local_image_name("org/comp:latest"), "org_comp");
        assert_eq!(local_image_name("org/comp"), "org_comp");
        assert_eq!(local_image_name("org/comp:v2"), "org_comp_v2");
    }

    #[test]
    fn test_start_args() {
        let backend = backend(Path::new("/images"));
        let opts = ServiceOptions::new("org/comp")
            .with_mount(Mount::read_only("/runs/r1", "/input"))
            .with_mount(Mount::new("/out/r1", "/output"));
        let args = backend
            .start_args(Path::new("/images/org_comp.sif"), "r1-step", 8105, &opts)
            .unwrap();

        assert_eq!(&args[..3], ["instance", "start", "--containall"]);
        assert_eq!(args[3], "-B");
        assert_eq!(args[4], "/runs/r1:/input:ro,/out/r1:/output");
        assert_eq!(args[5], "/images/org_comp.sif");
        assert_eq!(args[6], "r1-step");
        let launch = WorkerConfig::from_launch_arg(&args[7]).unwrap();
        assert_eq!(launch.port, 8105);
        assert_eq!(launch.server, Transport::Ws);
    }

    #[tokio::test]
    async fn test_image_directory_listing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(backend.list_images().await.unwrap().is_empty());

        std::fs::write(backend.image_path("org/comp"), b"sif").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let images = backend.list_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, "org_comp.sif");
        assert_eq!(images[0].size, 3);

        let info = backend.get_image("org/comp:latest").await.unwrap();
        assert_eq!(info.tags, vec!["org_comp"]);

        backend.remove_image("org/comp").await.unwrap();
        assert!(matches!(
            backend.get_image("org/comp").await,
            Err(Error::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_instance_listing() {
        let list: InstanceList = serde_json::from_str(
            r#"{"instances":[
                {"instance":"r1-sum","pid":41,"img":"/images/org_sum.sif"},
                {"pid":42}
            ]}"#,
        )
        .unwrap();
        let infos: Vec<_> = list.instances.iter().filter_map(instance_info).collect();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].service_id.as_deref(), Some("r1-sum"));
        assert_eq!(infos[0].image, "/images/org_sum.sif");
    }

    #[test]
    fn test_tail_lines() {
        let text = "a\nb\nc\n";
        assert_eq!(tail_lines(text, 2), "b\nc\n");
        assert_eq!(tail_lines(text, 5), text);
        assert_eq!(tail_lines(text, 0), "");
        assert_eq!(tail_lines("a\nb", 1), "b");
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = backend(Path::new("/images")).with_binary("fedrun-no-such-binary");
        let err = backend.ping().await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
    }
}
