//! Remote aggregation seam.
//!
//! Decentralized steps hand their output to a [`RemoteHandler`] and continue
//! with whatever it returns. How the exchange reaches the other sites is up
//! to the host application.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output of one iteration, local or remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Output object.
    pub output: Value,
    /// Set when the computation converged.
    #[serde(default)]
    pub success: bool,
}

/// Kind of remote exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteExchange {
    /// Aggregator's first exchange: nothing to send, wait for the sites.
    First,
    /// Send the current output and wait for the answer.
    Iteration,
    /// Send the final output; no answer is expected.
    Final,
}

/// One remote exchange request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    /// Pipeline run.
    pub run_id: String,
    /// Step index.
    pub step: usize,
    /// Controller iteration at the time of the exchange.
    pub iteration: u64,
    /// Exchange kind.
    pub exchange: RemoteExchange,
    /// Current output, absent on the aggregator's first exchange.
    pub output: Option<StepOutput>,
}

impl RemoteRequest {
    /// True for the aggregator's initial exchange.
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.exchange == RemoteExchange::First
    }

    /// True when no answer is expected.
    #[must_use]
    pub fn is_transmit_only(&self) -> bool {
        self.exchange == RemoteExchange::Final
    }
}

/// Carries step outputs to the other sites and back.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    /// Performs one exchange. The returned output is ignored for
    /// [`RemoteExchange::Final`].
    ///
    /// # Errors
    ///
    /// Returns error if the exchange fails; the run fails with it.
    async fn exchange(&self, request: RemoteRequest) -> Result<StepOutput>;
}

/// Handler for runs without decentralized steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

#[async_trait]
impl RemoteHandler for NoRemote {
    async fn exchange(&self, request: RemoteRequest) -> Result<StepOutput> {
        Err(Error::Remote(format!(
            "run '{}' step {} needs a remote exchange but no remote handler is configured",
            request.run_id, request.step
        )))
    }
}
