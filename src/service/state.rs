//! Service records and their lifecycle state.

use crate::backend::ContainerHandle;
use crate::error::Error;
use crate::protocol::ServiceInvoker;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lifecycle state of a service.
///
/// ```text
/// Starting ──► Running ──► ShuttingDown ──► (removed)
///                 │
///                 └──────► Zombie            (stop failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    /// Port allocation, container start or readiness check in progress.
    Starting,
    /// Container up and invocable.
    Running,
    /// Last user left; container stop in progress.
    ShuttingDown,
    /// Container stop failed. Treated as absent by new starts.
    Zombie,
}

impl ServiceState {
    /// Returns true if a new start must create a fresh record.
    #[must_use]
    pub fn is_defunct(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Zombie)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Zombie => "zombie",
        };
        f.write_str(s)
    }
}

/// Outcome of a start, shared by every caller waiting on it.
pub(crate) type StartOutcome = std::result::Result<Arc<dyn ServiceInvoker>, Arc<Error>>;

/// Pending start shared by concurrent callers.
pub(crate) type SharedStart = Shared<BoxFuture<'static, StartOutcome>>;

/// Entry of the service table.
pub(crate) struct ServiceRecord {
    /// Distinguishes this record from earlier ones under the same ID.
    pub generation: u64,
    pub state: ServiceState,
    pub port: Option<u16>,
    pub container: Option<Arc<dyn ContainerHandle>>,
    pub invoker: Option<Arc<dyn ServiceInvoker>>,
    pub users: BTreeSet<String>,
    pub start: SharedStart,
    pub error: Option<String>,
}

impl ServiceRecord {
    pub fn starting(generation: u64, user: &str, start: SharedStart) -> Self {
        let mut users = BTreeSet::new();
        users.insert(user.to_string());
        Self {
            generation,
            state: ServiceState::Starting,
            port: None,
            container: None,
            invoker: None,
            users,
            start,
            error: None,
        }
    }

    pub fn snapshot(&self, service_id: &str) -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: service_id.to_string(),
            state: self.state,
            port: self.port,
            container: self.container.as_ref().map(|c| c.id().to_string()),
            users: self.users.iter().cloned().collect(),
            error: self.error.clone(),
        }
    }
}

/// Point-in-time view of one service, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    /// Service ID.
    pub service_id: String,
    /// Lifecycle state.
    pub state: ServiceState,
    /// Host port, once allocated.
    pub port: Option<u16>,
    /// Backend container ID, once started.
    pub container: Option<String>,
    /// Users holding the service open, sorted.
    pub users: Vec<String>,
    /// Stop error of a zombie service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
