//! In-memory backend and invoker shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use fedrun::backend::{
    ContainerHandle, ContainerInfo, ContainerStats, CreatedService, ImageInfo, ProgressFn,
    PruneReport, PullProgress, ServiceBackend, ServiceOptions,
};
use fedrun::service::RetryPolicy;
use fedrun::{
    BackendKind, ControlFrame, Error, Invocation, InvocationOutput, ManagerConfig, Result,
    ServiceInvoker, ServiceManager, Transport,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Computes the worker's answer to one control frame.
pub type Handler = Arc<dyn Fn(&ControlFrame) -> Result<InvocationOutput> + Send + Sync>;

/// Handler answering every call with `{"output":{},"success":true}`.
pub fn succeed() -> Handler {
    Arc::new(|_| Ok(stdout(r#"{"output":{},"success":true}"#)))
}

pub fn stdout(s: &str) -> InvocationOutput {
    InvocationOutput {
        stdout: s.to_string(),
        stderr: String::new(),
        code: 0,
    }
}

// =============================================================================
// Invoker
// =============================================================================

pub struct MockInvoker {
    port: u16,
    transport: Transport,
    handler: Handler,
}

#[async_trait]
impl ServiceInvoker for MockInvoker {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput> {
        (self.handler)(&invocation.control)?.check_exit()
    }
}

// =============================================================================
// Container
// =============================================================================

pub struct MockContainer {
    id: String,
    pub running: AtomicBool,
    fail_stop: bool,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl ContainerHandle for MockContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(Error::CommandFailed {
                command: "stop".to_string(),
                status: 1,
                stderr: "device busy".to_string(),
            });
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Backend
// =============================================================================

pub struct MockBackend {
    handler: Handler,
    kind: BackendKind,
    /// Transport reported by the invokers.
    pub transport: Transport,
    /// Successful creates.
    pub creates: AtomicUsize,
    /// All create attempts, failed ones included.
    pub attempts: AtomicUsize,
    /// Container stops.
    pub stops: Arc<AtomicUsize>,
    /// Port races still to inject.
    pub port_races: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_stop: AtomicBool,
    pub create_delay: Duration,
    pub containers: Mutex<Vec<Arc<MockContainer>>>,
    pub created: Mutex<Vec<(String, u16, ServiceOptions)>>,
    pub removed: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            kind: BackendKind::Docker,
            transport: Transport::Ws,
            creates: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            port_races: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            create_delay: Duration::ZERO,
            containers: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_container(&self) -> Arc<MockContainer> {
        Arc::clone(self.containers.lock().unwrap().last().unwrap())
    }
}

#[async_trait]
impl ServiceBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn create_service(
        &self,
        service_id: &str,
        port: u16,
        opts: &ServiceOptions,
    ) -> Result<CreatedService> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let raced = self
            .port_races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if raced {
            return Err(Error::PortAllocation(format!(
                "Bind for 127.0.0.1:{port} failed: port is already allocated"
            )));
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::ImageNotFound(opts.image.clone()));
        }

        self.creates.fetch_add(1, Ordering::SeqCst);
        let container = Arc::new(MockContainer {
            id: format!("{service_id}-{port}"),
            running: AtomicBool::new(true),
            fail_stop: self.fail_stop.load(Ordering::SeqCst),
            stops: Arc::clone(&self.stops),
        });
        self.containers.lock().unwrap().push(Arc::clone(&container));
        self.created
            .lock()
            .unwrap()
            .push((service_id.to_string(), port, opts.clone()));
        Ok(CreatedService {
            invoker: Arc::new(MockInvoker {
                port,
                transport: self.transport,
                handler: Arc::clone(&self.handler),
            }),
            container,
        })
    }

    async fn pull(&self, image: &str, progress: ProgressFn) -> Result<()> {
        progress(&PullProgress {
            image: image.to_string(),
            status: "Pull complete".to_string(),
            detail: None,
        });
        if image.contains("missing") {
            return Err(Error::ImageNotFound(image.to_string()));
        }
        Ok(())
    }

    async fn get_image(&self, image: &str) -> Result<ImageInfo> {
        Err(Error::ImageNotFound(image.to_string()))
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(Vec::new())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.removed.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn prune_images(&self) -> Result<PruneReport> {
        Ok(PruneReport::default())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .iter()
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                name: c.id.clone(),
                image: "fedrun/mock".to_string(),
                state: if c.running.load(Ordering::SeqCst) {
                    "running"
                } else {
                    "exited"
                }
                .to_string(),
                service_id: c.id.rsplit_once('-').map(|(id, _)| id.to_string()),
                created: None,
            })
            .collect())
    }

    async fn container_stats(&self, container_id: &str) -> Result<ContainerStats> {
        if !self.containers.lock().unwrap().iter().any(|c| c.id == container_id) {
            return Err(Error::ServiceNotFound(container_id.to_string()));
        }
        Ok(ContainerStats::from_docker_json(
            container_id,
            serde_json::json!({"memory_stats": {"usage": 2048, "limit": 8192}}),
        ))
    }

    async fn container_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        let lines = [format!("{container_id} listening"), "ready".to_string()];
        let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
        Ok(lines[skip..].iter().map(|l| format!("{l}\n")).collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Manager config over a high port range, away from the default one.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        port_start: 42000,
        port_end: 42999,
        ..Default::default()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        port_retries: 5,
        port_retry_delay: Duration::from_millis(1),
        readiness_retries: 3,
        readiness_delay: Duration::from_millis(1),
        readiness_fallback: Duration::from_millis(1),
    }
}

pub fn manager(backend: Arc<MockBackend>) -> ServiceManager {
    ServiceManager::with_backend(backend, &test_config()).with_retry_policy(fast_retry())
}
