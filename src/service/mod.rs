//! # Container Service Manager
//!
//! Owns the table of worker services, one per `service_id`, and hands out
//! invokers for them. Services are shared: every caller names itself with a
//! user ID and the container is stopped once the last user releases it.
//!
//! ```text
//!   start_service(id, user, opts)
//!        │
//!        ├─ no record / shutting-down / zombie ─► new record (Starting)
//!        │                                          pending start installed
//!        │                                          under the table lock
//!        │                                             │
//!        │        ┌────────────────────────────────────┘
//!        │        ▼
//!        │   allocate port ─► backend.create_service ─► readiness check
//!        │        ▲                   │ port race                │
//!        │        └───────────────────┘ (retry)                  ▼
//!        │                                                   Running
//!        ├─ Starting ─► await the same pending start
//!        └─ Running  ─► inspect container ─► alive: existing invoker
//!                                          └► dead: restart (Starting)
//! ```
//!
//! Concurrent starts for one ID always share a single backend
//! `create_service` call. The start runs as its own task, so callers giving
//! up early do not abort it.

mod port;
mod state;

pub use self::port::PortAllocator;
pub use self::state::{ServiceSnapshot, ServiceState};

use self::state::{ServiceRecord, SharedStart, StartOutcome};
use crate::backend::{
    create_backend, with_default_tag, ContainerHandle, ContainerInfo, ContainerStats,
    CreatedService, ImageInfo, ImageOutcome, ProgressFn, PruneReport, ServiceBackend,
    ServiceOptions,
};
use crate::config::{BackendKind, ManagerConfig, Transport};
use crate::constants::{
    validate_service_id, PORT_ALLOCATION_RETRIES, PORT_ALLOCATION_RETRY_DELAY,
    READINESS_FALLBACK_WAIT, READINESS_RETRIES, READINESS_RETRY_DELAY, WORKER_DEBUG_ENV,
    WORKER_PORT_ENV,
};
use crate::error::{Error, Result};
use crate::protocol::{ControlFrame, Invocation, ServiceInvoker};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry budgets, overridable for tests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Port race retries.
    pub port_retries: u32,
    /// Delay between port race retries.
    pub port_retry_delay: Duration,
    /// Readiness check attempts.
    pub readiness_retries: u32,
    /// Delay between readiness checks.
    pub readiness_delay: Duration,
    /// Wait after the attempt budget is spent.
    pub readiness_fallback: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            port_retries: PORT_ALLOCATION_RETRIES,
            port_retry_delay: PORT_ALLOCATION_RETRY_DELAY,
            readiness_retries: READINESS_RETRIES,
            readiness_delay: READINESS_RETRY_DELAY,
            readiness_fallback: READINESS_FALLBACK_WAIT,
        }
    }
}

struct Inner {
    backend: RwLock<Arc<dyn ServiceBackend>>,
    config: ManagerConfig,
    ports: PortAllocator,
    services: Mutex<HashMap<String, ServiceRecord>>,
    generation: AtomicU64,
    retry: RetryPolicy,
}

impl Inner {
    fn table(&self) -> Result<MutexGuard<'_, HashMap<String, ServiceRecord>>> {
        self.services
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Backend for new operations. Running services keep the handles of the
    /// backend that started them.
    fn backend(&self) -> Arc<dyn ServiceBackend> {
        Arc::clone(&self.backend.read().unwrap_or_else(PoisonError::into_inner))
    }
}

enum Lookup {
    Pending(SharedStart),
    Verify {
        generation: u64,
        container: Arc<dyn ContainerHandle>,
        invoker: Arc<dyn ServiceInvoker>,
    },
}

/// Manages worker services on one backend.
///
/// Cheap to clone; clones share the service table and port ledger.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("backend", &self.inner.backend().kind())
            .field("ports", &self.inner.ports.range())
            .finish()
    }
}

impl ServiceManager {
    /// Builds the backend selected by `config` and a manager over it.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the backend cannot
    /// be created.
    pub fn from_config(config: &ManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_backend(create_backend(config)?, config))
    }

    /// Manager over an existing backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn ServiceBackend>, config: &ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: RwLock::new(backend),
                config: config.clone(),
                ports: PortAllocator::new(config.host.clone(), config.port_start, config.port_end),
                services: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                retry: RetryPolicy::default(),
            }),
        }
    }

    /// Replaces the retry budgets. Only effective before the manager is
    /// cloned.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.retry = retry;
        }
        self
    }

    /// Returns the current backend.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn ServiceBackend> {
        self.inner.backend()
    }

    /// Switches the backend used for new starts and image operations.
    /// Services already running stay on the backend that started them.
    pub fn set_backend(&self, backend: Arc<dyn ServiceBackend>) {
        let mut current = self
            .inner
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        info!(from = %current.kind(), to = %backend.kind(), "switching service backend");
        *current = backend;
    }

    /// Switches to a fresh backend of `kind`, built from this manager's
    /// configuration. Switching to the current kind is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] if the backend cannot be
    /// created.
    pub fn set_service_provider(&self, kind: BackendKind) -> Result<()> {
        if self.inner.backend().kind() == kind {
            return Ok(());
        }
        let config = ManagerConfig {
            backend: kind,
            ..self.inner.config.clone()
        };
        self.set_backend(create_backend(&config)?);
        Ok(())
    }

    /// Returns the port allocator.
    #[must_use]
    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    // =========================================================================
    // Service Lifecycle
    // =========================================================================

    /// Starts the service `service_id` or joins the running one, registering
    /// `user_id` as a user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidServiceId`] for a malformed ID and
    /// [`Error::ServiceStart`] if the start failed; every concurrent caller
    /// of the same start receives the same failure.
    pub async fn start_service(
        &self,
        service_id: &str,
        user_id: &str,
        opts: ServiceOptions,
    ) -> Result<Arc<dyn ServiceInvoker>> {
        validate_service_id(service_id).map_err(|reason| Error::InvalidServiceId {
            id: service_id.to_string(),
            reason: reason.to_string(),
        })?;

        let mut lookup = self.lookup_or_start(service_id, user_id, &opts)?;
        loop {
            match lookup {
                Lookup::Pending(start) => {
                    return start.await.map_err(|e| match e.as_ref() {
                        Error::ServiceStart { id, reason } => Error::ServiceStart {
                            id: id.clone(),
                            reason: reason.clone(),
                        },
                        other => Error::ServiceStart {
                            id: service_id.to_string(),
                            reason: other.to_string(),
                        },
                    });
                }
                Lookup::Verify {
                    generation,
                    container,
                    invoker,
                } => {
                    if container.is_running().await? {
                        debug!(service_id, user_id, "returning already started service");
                        return Ok(invoker);
                    }
                    info!(service_id, "service container down, starting new instance");
                    lookup = self.restart(service_id, user_id, generation, &opts)?;
                }
            }
        }
    }

    fn lookup_or_start(
        &self,
        service_id: &str,
        user_id: &str,
        opts: &ServiceOptions,
    ) -> Result<Lookup> {
        let mut table = self.inner.table()?;
        if let Some(record) = table.get_mut(service_id) {
            if !record.state.is_defunct() {
                record.users.insert(user_id.to_string());
                if record.state == ServiceState::Running {
                    if let (Some(container), Some(invoker)) =
                        (record.container.clone(), record.invoker.clone())
                    {
                        return Ok(Lookup::Verify {
                            generation: record.generation,
                            container,
                            invoker,
                        });
                    }
                }
                return Ok(Lookup::Pending(record.start.clone()));
            }
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let start = self.spawn_start(service_id, generation, opts.clone());
        debug!(service_id, user_id, generation, "creating service record");
        table.insert(
            service_id.to_string(),
            ServiceRecord::starting(generation, user_id, start.clone()),
        );
        Ok(Lookup::Pending(start))
    }

    /// Puts a dead running service back into `Starting`, keeping its users.
    fn restart(
        &self,
        service_id: &str,
        user_id: &str,
        generation: u64,
        opts: &ServiceOptions,
    ) -> Result<Lookup> {
        let mut table = self.inner.table()?;
        match table.get_mut(service_id) {
            Some(record)
                if record.generation == generation && record.state == ServiceState::Running =>
            {
                let next = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let start = self.spawn_start(service_id, next, opts.clone());
                record.generation = next;
                record.state = ServiceState::Starting;
                record.container = None;
                record.invoker = None;
                record.users.insert(user_id.to_string());
                record.start = start.clone();
                Ok(Lookup::Pending(start))
            }
            // Another caller already restarted or stopped it.
            _ => {
                drop(table);
                self.lookup_or_start(service_id, user_id, opts)
            }
        }
    }

    fn spawn_start(&self, service_id: &str, generation: u64, opts: ServiceOptions) -> SharedStart {
        let inner = Arc::clone(&self.inner);
        let id = service_id.to_string();
        let handle = tokio::spawn(async move {
            let result = provision(&inner, &id, generation, &opts).await;
            settle(&inner, &id, generation, result).await
        });
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Arc::new(Error::Internal(format!(
                    "service start task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared()
    }

    /// Releases `user_id`'s hold on `service_id`. The container is stopped
    /// when the last user leaves. With `wait` false the stop runs in the
    /// background.
    ///
    /// Unknown services are ignored. A failed stop leaves the record as a
    /// zombie and is not reported to the caller.
    ///
    /// # Errors
    ///
    /// Returns error only if the service table is unusable.
    pub async fn stop_service(&self, service_id: &str, user_id: &str, wait: bool) -> Result<()> {
        let (generation, container) = {
            let mut table = self.inner.table()?;
            let Some(record) = table.get_mut(service_id) else {
                return Ok(());
            };
            record.users.remove(user_id);
            if !record.users.is_empty() {
                return Ok(());
            }
            match record.state {
                ServiceState::Starting => {
                    // The start task stops the container once it finds the
                    // record gone.
                    table.remove(service_id);
                    debug!(service_id, "service released while starting");
                    return Ok(());
                }
                ServiceState::ShuttingDown | ServiceState::Zombie => return Ok(()),
                ServiceState::Running => {
                    record.state = ServiceState::ShuttingDown;
                    match record.container.clone() {
                        Some(container) => (record.generation, container),
                        None => {
                            table.remove(service_id);
                            return Ok(());
                        }
                    }
                }
            }
        };

        info!(service_id, "last user left, stopping service");
        let inner = Arc::clone(&self.inner);
        let id = service_id.to_string();
        let stop = async move {
            let result = container.stop().await;
            let Ok(mut table) = inner.table() else {
                return;
            };
            let current = table
                .get(&id)
                .is_some_and(|r| r.generation == generation);
            match result {
                Ok(()) => {
                    if current {
                        table.remove(&id);
                    }
                    debug!(service_id = %id, "service stopped");
                }
                Err(e) => {
                    warn!(service_id = %id, error = %e, "service stop failed, marking zombie");
                    if let Some(record) = table.get_mut(&id).filter(|_| current) {
                        record.state = ServiceState::Zombie;
                        record.error = Some(e.to_string());
                    }
                }
            }
        };
        if wait {
            stop.await;
        } else {
            tokio::spawn(stop);
        }
        Ok(())
    }

    /// Stops every service concurrently and clears the table. Services
    /// still starting are awaited first so their containers are stopped too.
    ///
    /// # Errors
    ///
    /// Returns the first stop failure after all stops were attempted.
    pub async fn stop_all_services(&self) -> Result<()> {
        let pending: Vec<(String, SharedStart)> = {
            let table = self.inner.table()?;
            table
                .iter()
                .filter(|(_, record)| record.state == ServiceState::Starting)
                .map(|(id, record)| (id.clone(), record.start.clone()))
                .collect()
        };
        for (id, start) in pending {
            if let Err(e) = start.await {
                debug!(service_id = %id, error = %e, "pending start failed before stop");
            }
        }

        let containers: Vec<(String, Arc<dyn ContainerHandle>)> = {
            let mut table = self.inner.table()?;
            table
                .drain()
                .filter_map(|(id, record)| record.container.map(|c| (id, c)))
                .collect()
        };
        info!(count = containers.len(), "stopping all services");
        let results = futures::future::join_all(containers.into_iter().map(
            |(id, container)| async move {
                container.stop().await.map_err(|e| {
                    error!(service_id = %id, error = %e, "failed to stop service");
                    e
                })
            },
        ))
        .await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Snapshot of every service, sorted by ID.
    #[must_use]
    pub fn get_services(&self) -> Vec<ServiceSnapshot> {
        let Ok(table) = self.inner.table() else {
            return Vec::new();
        };
        let mut snapshots: Vec<_> = table
            .iter()
            .map(|(id, record)| record.snapshot(id))
            .collect();
        snapshots.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        snapshots
    }

    /// Snapshot of one service.
    #[must_use]
    pub fn get_service(&self, service_id: &str) -> Option<ServiceSnapshot> {
        self.inner
            .table()
            .ok()?
            .get(service_id)
            .map(|record| record.snapshot(service_id))
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Lists the backend's worker containers.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot list containers.
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.inner.backend().list_containers().await
    }

    /// Returns a container's logs, optionally only the last `tail` lines.
    ///
    /// # Errors
    ///
    /// Returns error if the backend has no logs for the container.
    pub async fn get_container_logs(
        &self,
        container_id: &str,
        tail: Option<usize>,
    ) -> Result<String> {
        self.inner.backend().container_logs(container_id, tail).await
    }

    /// Resource usage of the service `service_id`, waiting for a pending
    /// start first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] if the service is unknown or has
    /// no container, the start failure if it failed to start, or the
    /// backend's error.
    pub async fn get_stats(&self, service_id: &str) -> Result<ContainerStats> {
        let pending = {
            let table = self.inner.table()?;
            let record = table
                .get(service_id)
                .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
            (record.state == ServiceState::Starting).then(|| record.start.clone())
        };
        if let Some(start) = pending {
            start.await.map_err(|e| Error::ServiceStart {
                id: service_id.to_string(),
                reason: e.to_string(),
            })?;
        }
        let container = self
            .inner
            .table()?
            .get(service_id)
            .and_then(|record| record.container.clone())
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
        self.inner.backend().container_stats(container.id()).await
    }

    /// Resource usage of every listed container.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails or any container reports no
    /// statistics.
    pub async fn get_container_stats(&self) -> Result<Vec<ContainerStats>> {
        let backend = self.inner.backend();
        let containers = backend.list_containers().await?;
        futures::future::try_join_all(
            containers
                .iter()
                .map(|container| backend.container_stats(&container.id)),
        )
        .await
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Pulls every image concurrently. Failures are reported per image.
    pub async fn pull_images_from_list(
        &self,
        images: &[String],
        progress: ProgressFn,
    ) -> Vec<ImageOutcome> {
        let backend = self.inner.backend();
        let backend = &backend;
        futures::future::join_all(images.iter().map(|image| {
            let progress = Arc::clone(&progress);
            async move {
                let error = backend.pull(image, progress).await.err().map(|e| {
                    warn!(image = %image, error = %e, "image pull failed");
                    e.to_string()
                });
                ImageOutcome {
                    image: image.clone(),
                    error,
                }
            }
        }))
        .await
    }

    /// Removes every image, adding `:latest` to untagged references.
    /// Failures are reported per image.
    pub async fn remove_images_from_list(&self, images: &[String]) -> Vec<ImageOutcome> {
        let backend = self.inner.backend();
        let backend = &backend;
        futures::future::join_all(images.iter().map(|image| async move {
            let image = with_default_tag(image);
            let error = backend.remove_image(&image).await.err().map(|e| {
                warn!(image = %image, error = %e, "image removal failed");
                e.to_string()
            });
            ImageOutcome { image, error }
        }))
        .await
    }

    /// Removes unused images.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot prune.
    pub async fn prune_images(&self) -> Result<PruneReport> {
        self.inner.backend().prune_images().await
    }

    /// Lists local images.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be queried.
    pub async fn get_images(&self) -> Result<Vec<ImageInfo>> {
        self.inner.backend().list_images().await
    }

    /// Returns true if the backend answers.
    pub async fn get_status(&self) -> bool {
        match self.inner.backend().ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "backend status check failed");
                false
            }
        }
    }
}

// =============================================================================
// Start Task
// =============================================================================

/// Caller options plus the defaults every worker gets.
fn options_with_defaults(opts: &ServiceOptions, port: u16, debug: bool) -> ServiceOptions {
    let mut opts = opts.clone();
    opts.set_env(WORKER_PORT_ENV, port);
    if debug {
        opts.set_env(WORKER_DEBUG_ENV, 1);
    }
    opts
}

async fn provision(
    inner: &Inner,
    service_id: &str,
    generation: u64,
    opts: &ServiceOptions,
) -> Result<CreatedService> {
    let mut attempt = 0;
    let created = loop {
        let port = inner.ports.allocate().await.map_err(|e| match e {
            Error::PortsExhausted { .. } => e,
            other => Error::PortAllocation(other.to_string()),
        })?;
        {
            let mut table = inner.table()?;
            if let Some(record) = table
                .get_mut(service_id)
                .filter(|r| r.generation == generation)
            {
                record.port = Some(port);
            }
        }
        debug!(service_id, port, attempt, "starting service");

        let service_opts = options_with_defaults(opts, port, inner.config.debug);
        match inner
            .backend()
            .create_service(service_id, port, &service_opts)
            .await
        {
            Ok(created) => break created,
            Err(e) if e.is_port_race() && attempt < inner.retry.port_retries => {
                attempt += 1;
                warn!(service_id, port, attempt, "port already allocated, retrying");
                tokio::time::sleep(inner.retry.port_retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    };

    if created.invoker.transport() == Transport::Http {
        if let Err(e) = wait_ready(inner, service_id, created.invoker.as_ref()).await {
            if let Err(stop) = created.container.stop().await {
                warn!(service_id, error = %stop, "failed to stop unready service");
            }
            return Err(e);
        }
    }
    Ok(created)
}

/// Checks an HTTP worker with `echo test` until it answers.
async fn wait_ready(inner: &Inner, service_id: &str, invoker: &dyn ServiceInvoker) -> Result<()> {
    let retry = inner.retry;
    for attempt in 1..=retry.readiness_retries {
        match invoker.invoke(Invocation::new(ControlFrame::readiness_echo())).await {
            Ok(_) => {
                debug!(service_id, attempt, "service ready");
                return Ok(());
            }
            Err(e) if e.is_connection_reset() => {
                tokio::time::sleep(retry.readiness_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
    warn!(
        service_id,
        attempts = retry.readiness_retries,
        "service not answering, one last attempt after fallback wait"
    );
    tokio::time::sleep(retry.readiness_fallback).await;
    match invoker.invoke(Invocation::new(ControlFrame::readiness_echo())).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_connection_reset() => Err(Error::ReadinessTimeout {
            id: service_id.to_string(),
            attempts: retry.readiness_retries + 1,
        }),
        Err(e) => Err(e),
    }
}

/// Records the start outcome on the service's record, or stops the
/// container if the record was released meanwhile.
async fn settle(
    inner: &Inner,
    service_id: &str,
    generation: u64,
    result: Result<CreatedService>,
) -> StartOutcome {
    let orphan = {
        let mut table = match inner.table() {
            Ok(table) => table,
            Err(e) => return Err(Arc::new(e)),
        };
        let current = table
            .get(service_id)
            .is_some_and(|r| r.generation == generation);
        match result {
            Ok(created) if current => {
                if let Some(record) = table.get_mut(service_id) {
                    record.state = ServiceState::Running;
                    record.container = Some(Arc::clone(&created.container));
                    record.invoker = Some(Arc::clone(&created.invoker));
                }
                info!(service_id, endpoint = %created.invoker.endpoint(), "service running");
                return Ok(created.invoker);
            }
            Ok(created) => created,
            Err(e) => {
                if current {
                    table.remove(service_id);
                }
                error!(service_id, error = %e, "service start failed");
                return Err(Arc::new(e));
            }
        }
    };

    debug!(service_id, "service released while starting, stopping container");
    if let Err(e) = orphan.container.stop().await {
        warn!(service_id, error = %e, "failed to stop released service");
    }
    Err(Arc::new(Error::ServiceStart {
        id: service_id.to_string(),
        reason: "released before it started".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = options_with_defaults(&ServiceOptions::new("img"), 8101, true);
        assert_eq!(opts.env_value(WORKER_PORT_ENV), Some("8101"));
        assert_eq!(opts.env_value(WORKER_DEBUG_ENV), Some("1"));

        let opts = options_with_defaults(&ServiceOptions::new("img"), 8102, false);
        assert_eq!(opts.env_value(WORKER_DEBUG_ENV), None);
    }
}
