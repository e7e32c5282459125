//! Docker backend.
//!
//! Talks to the local engine through bollard. Each service is one container
//! whose worker port is published on `127.0.0.1:<service port>`:
//!
//! ```text
//!   host 127.0.0.1:8101 ──► container :8881/tcp ──► worker (ws | http)
//!   host 127.0.0.1:4401 ──► container :4444/tcp      (debug only)
//! ```
//!
//! With `network_mode = "host"` nothing is published and the worker is told
//! to listen on the service port directly.

use super::{
    split_image_ref, worker_log_level, ContainerHandle, ContainerInfo, ContainerStats,
    CreatedService, ImageInfo, ProgressFn, PruneReport, PullProgress, ServiceBackend,
    ServiceOptions,
};
use crate::config::{BackendKind, ManagerConfig, Transport};
use crate::constants::{CONTAINER_STOP_GRACE_SECS, WORKER_DEBUG_PORT};
use crate::error::{Error, Result};
use crate::protocol::{connect_invoker, WorkerConfig};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerSummary, DeviceRequest, HostConfig, PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, ListImagesOptionsBuilder, LogsOptionsBuilder,
    PruneImagesOptions, RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::Docker;
use chrono::DateTime;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Label carrying the service ID on every worker container.
pub const SERVICE_LABEL: &str = "fedrun.service";

fn is_status(error: &BollardError, status: u16) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == status
    )
}

fn is_not_found(error: &BollardError) -> bool {
    is_status(error, 404)
}

fn container_info(summary: ContainerSummary) -> ContainerInfo {
    let name = summary
        .names
        .unwrap_or_default()
        .into_iter()
        .next()
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();
    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name,
        image: summary.image.unwrap_or_default(),
        state: summary.state.map(|s| s.to_string()).unwrap_or_default(),
        service_id: summary
            .labels
            .and_then(|mut labels| labels.remove(SERVICE_LABEL)),
        created: summary
            .created
            .and_then(|created| DateTime::from_timestamp(created, 0)),
    }
}

// =============================================================================
// Container Settings
// =============================================================================

/// Engine-independent part of the backend: everything needed to describe a
/// worker container.
#[derive(Debug, Clone)]
pub(crate) struct DockerSettings {
    host: String,
    worker_port: u16,
    transport: Transport,
    debug: bool,
    gpu: bool,
    network_mode: Option<String>,
}

impl DockerSettings {
    pub(crate) fn from_config(config: &ManagerConfig) -> Self {
        Self {
            host: config.host.clone(),
            worker_port: config.worker_port,
            transport: config.transport,
            debug: config.debug,
            gpu: config.gpu,
            network_mode: config.network_mode.clone(),
        }
    }

    fn host_network(&self) -> bool {
        self.network_mode.as_deref() == Some("host")
    }

    /// Debug port published for a service port: `44` followed by its last two
    /// digits.
    pub(crate) fn debug_host_port(port: u16) -> String {
        format!("44{:02}", port % 100)
    }

    /// Creation body for the worker of `service_id` on host `port`.
    pub(crate) fn container_body(
        &self,
        service_id: &str,
        port: u16,
        opts: &ServiceOptions,
    ) -> Result<ContainerCreateBody> {
        let host_network = self.host_network();
        let listen_port = if host_network { port } else { self.worker_port };
        let launch = WorkerConfig {
            level: worker_log_level(self.debug).to_string(),
            server: self.transport,
            port: listen_port,
            host: "0.0.0.0".to_string(),
        }
        .to_launch_arg()?;
        let mut cmd = opts.worker_command.clone();
        cmd.push(launch);

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        if !host_network {
            let worker_key = format!("{}/tcp", self.worker_port);
            exposed_ports.insert(worker_key.clone(), HashMap::new());
            port_bindings.insert(
                worker_key,
                Some(vec![PortBinding {
                    host_ip: Some(self.host.clone()),
                    host_port: Some(port.to_string()),
                }]),
            );
            if self.debug {
                let debug_key = format!("{WORKER_DEBUG_PORT}/tcp");
                exposed_ports.insert(debug_key.clone(), HashMap::new());
                port_bindings.insert(
                    debug_key,
                    Some(vec![PortBinding {
                        host_ip: Some(self.host.clone()),
                        host_port: Some(Self::debug_host_port(port)),
                    }]),
                );
            }
        }

        let device_requests = self.gpu.then(|| {
            vec![DeviceRequest {
                count: Some(-1),
                driver: Some("nvidia".to_string()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..DeviceRequest::default()
            }]
        });

        let mut labels = opts.labels.clone();
        labels.insert(SERVICE_LABEL.to_string(), service_id.to_string());

        let binds: Vec<String> = opts.mounts.iter().map(|m| m.to_bind_spec()).collect();

        Ok(ContainerCreateBody {
            image: Some(opts.image.clone()),
            cmd: Some(cmd),
            env: (!opts.env.is_empty()).then(|| opts.env.clone()),
            labels: Some(labels),
            tty: Some(true),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                network_mode: self.network_mode.clone(),
                device_requests,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        })
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Backend driving the local Docker engine.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
    settings: DockerSettings,
}

impl DockerBackend {
    /// Connects to the engine with the local defaults (`DOCKER_HOST` or the
    /// platform socket).
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] if the client cannot be built.
    pub fn connect(config: &ManagerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            Error::BackendUnavailable {
                backend: "docker".to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::with_client(docker, config))
    }

    /// Uses an existing client.
    #[must_use]
    pub fn with_client(docker: Docker, config: &ManagerConfig) -> Self {
        Self {
            docker,
            settings: DockerSettings::from_config(config),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ServiceBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn create_service(
        &self,
        service_id: &str,
        port: u16,
        opts: &ServiceOptions,
    ) -> Result<CreatedService> {
        let body = self.settings.container_body(service_id, port, opts)?;
        // Port in the name keeps retries after a port race from colliding
        // with the failed attempt's container.
        let name = format!("fedrun-{service_id}-{port}");
        debug!(service_id, port, name = %name, image = %opts.image, "creating worker container");

        self.remove_container(&name).await?;
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await?;
        for warning in &created.warnings {
            warn!(service_id, "docker: {warning}");
        }

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            if let Err(cleanup) = self.remove_container(&created.id).await {
                warn!(service_id, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(e.into());
        }
        info!(service_id, port, container = %created.id, "worker container started");

        Ok(CreatedService {
            invoker: connect_invoker(self.settings.transport, &self.settings.host, port),
            container: Arc::new(DockerContainer {
                docker: self.docker.clone(),
                id: created.id,
            }),
        })
    }

    async fn pull(&self, image: &str, progress: ProgressFn) -> Result<()> {
        let (from_image, tag) = split_image_ref(image);
        let mut builder = CreateImageOptionsBuilder::new().from_image(from_image);
        if let Some(tag) = tag {
            builder = builder.tag(tag);
        }
        info!(image, "pulling image");
        let mut stream = self.docker.create_image(Some(builder.build()), None, None);
        while let Some(item) = stream.next().await {
            let item = item?;
            let status = match (item.id, item.status) {
                (Some(id), Some(status)) => format!("{id}: {status}"),
                (None, Some(status)) => status,
                (Some(id), None) => id,
                (None, None) => continue,
            };
            progress(&PullProgress {
                image: image.to_string(),
                status,
                detail: item.progress,
            });
        }
        Ok(())
    }

    async fn get_image(&self, image: &str) -> Result<ImageInfo> {
        match self.docker.inspect_image(image).await {
            Ok(inspect) => Ok(ImageInfo {
                id: inspect.id.unwrap_or_else(|| image.to_string()),
                tags: inspect.repo_tags.unwrap_or_default(),
                size: inspect.size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
                created: None,
            }),
            Err(e) if is_not_found(&e) => Err(Error::ImageNotFound(image.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptionsBuilder::new().all(false).build()))
            .await?;
        Ok(images
            .into_iter()
            .map(|summary| ImageInfo {
                id: summary.id,
                tags: summary.repo_tags,
                size: u64::try_from(summary.size).unwrap_or(0),
                created: DateTime::from_timestamp(summary.created, 0),
            })
            .collect())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        match self
            .docker
            .remove_image(
                image,
                Some(RemoveImageOptionsBuilder::new().force(true).build()),
                None,
            )
            .await
        {
            Ok(items) => {
                debug!(image, removed = items.len(), "image removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Err(Error::ImageNotFound(image.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        let response = self
            .docker
            .prune_images(None::<PruneImagesOptions>)
            .await?;
        let removed = response
            .images_deleted
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| item.deleted.or(item.untagged))
            .collect();
        Ok(PruneReport {
            removed,
            reclaimed: response
                .space_reclaimed
                .and_then(|s| u64::try_from(s).ok())
                .unwrap_or(0),
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let filters = HashMap::from([("label", vec![SERVICE_LABEL])]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await?;
        Ok(containers.into_iter().map(container_info).collect())
    }

    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptionsBuilder::new().stream(false).one_shot(true).build()),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(ContainerStats::from_docker_json(
                container_id,
                serde_json::to_value(&response)?,
            )),
            Some(Err(e)) if is_not_found(&e) => {
                Err(Error::ServiceNotFound(container_id.to_string()))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::ProtocolParse(format!(
                "docker returned no statistics for {container_id}"
            ))),
        }
    }

    async fn container_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        let mut stream = self.docker.logs(
            container_id,
            Some(
                LogsOptionsBuilder::new()
                    .stdout(true)
                    .stderr(true)
                    .tail(&tail)
                    .build(),
            ),
        );
        let mut logs = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output) => logs.push_str(&String::from_utf8_lossy(&output.into_bytes())),
                Err(e) if is_not_found(&e) => {
                    return Err(Error::ServiceNotFound(container_id.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(logs)
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| Error::BackendUnavailable {
                backend: "docker".to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

// =============================================================================
// Container Handle
// =============================================================================

struct DockerContainer {
    docker: Docker,
    id: String,
}

#[async_trait]
impl ContainerHandle for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_running(&self) -> Result<bool> {
        match self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self) -> Result<()> {
        match self
            .docker
            .stop_container(
                &self.id,
                Some(StopContainerOptionsBuilder::new().t(CONTAINER_STOP_GRACE_SECS).build()),
            )
            .await
        {
            // 304: already stopped
            Ok(()) => {}
            Err(e) if is_not_found(&e) || is_status(&e, 304) => {}
            Err(e) => return Err(e.into()),
        }
        match self
            .docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
