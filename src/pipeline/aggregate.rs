//! Aggregator-side collection of site outputs.
//!
//! On the aggregator every remote exchange of a decentralized step waits for
//! one output from each participating site. Sites may report before the
//! aggregator reaches the exchange; their outputs are held until the round
//! completes and are then handed to the computation keyed by client ID:
//!
//! ```text
//!   site2 ─ submit ─┐
//!                   ├─► round store ─► exchange() ─► {"site2": .., "site3": ..}
//!   site3 ─ submit ─┘        │
//!                            └─ waiting_on() = clients not yet reported
//! ```
//!
//! Outputs the aggregator sends to the sites (iteration and final
//! transmits) are published on a broadcast channel for the host's transport.

use super::remote::{RemoteExchange, RemoteHandler, RemoteRequest, StepOutput};
use crate::constants::STATE_EVENT_CAPACITY;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};
use tracing::debug;

/// Collects one output per site and round for an aggregating run.
#[derive(Debug)]
pub struct RoundCollector {
    run_id: String,
    clients: BTreeSet<String>,
    received: Mutex<BTreeMap<String, Value>>,
    changed: Notify,
    outbound: broadcast::Sender<RemoteRequest>,
}

impl RoundCollector {
    /// Collector for `run_id` expecting outputs from `clients`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPipeline`] if `clients` is empty.
    pub fn new<I, S>(run_id: impl Into<String>, clients: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let run_id = run_id.into();
        let clients: BTreeSet<String> = clients.into_iter().map(Into::into).collect();
        if clients.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "aggregating run '{run_id}' has no clients"
            )));
        }
        let (outbound, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        Ok(Self {
            run_id,
            clients,
            received: Mutex::new(BTreeMap::new()),
            changed: Notify::new(),
            outbound,
        })
    }

    fn store(&self) -> Result<MutexGuard<'_, BTreeMap<String, Value>>> {
        self.received
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Participating clients, sorted.
    #[must_use]
    pub fn clients(&self) -> Vec<String> {
        self.clients.iter().cloned().collect()
    }

    /// Records `client_id`'s output for the current round and returns the
    /// clients still outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] for a client that is not part of the run.
    pub fn submit(&self, client_id: &str, output: Value) -> Result<Vec<String>> {
        if !self.clients.contains(client_id) {
            return Err(Error::Remote(format!(
                "client '{client_id}' is not part of run '{}'",
                self.run_id
            )));
        }
        let waiting = {
            let mut store = self.store()?;
            store.insert(client_id.to_string(), output);
            self.pending(&store)
        };
        debug!(run_id = %self.run_id, client_id, waiting = waiting.len(), "site output received");
        self.changed.notify_waiters();
        Ok(waiting)
    }

    /// Clients whose output for the current round has not arrived.
    #[must_use]
    pub fn waiting_on(&self) -> Vec<String> {
        match self.store() {
            Ok(store) => self.pending(&store),
            Err(_) => self.clients(),
        }
    }

    /// Subscribes to the outputs sent to the sites.
    #[must_use]
    pub fn outbound(&self) -> broadcast::Receiver<RemoteRequest> {
        self.outbound.subscribe()
    }

    fn pending(&self, store: &BTreeMap<String, Value>) -> Vec<String> {
        self.clients
            .iter()
            .filter(|client| !store.contains_key(*client))
            .cloned()
            .collect()
    }

    /// Takes the round's outputs once every client reported.
    fn take_complete(&self) -> Result<Option<Map<String, Value>>> {
        let mut store = self.store()?;
        if !self.pending(&store).is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut *store).into_iter().collect()))
    }

    async fn collect_round(&self) -> Result<Map<String, Value>> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if let Some(outputs) = self.take_complete()? {
                return Ok(outputs);
            }
            changed.await;
        }
    }
}

#[async_trait]
impl RemoteHandler for RoundCollector {
    async fn exchange(&self, request: RemoteRequest) -> Result<StepOutput> {
        let exchange = request.exchange;
        if exchange != RemoteExchange::First {
            // No site listening is fine; the host may poll instead.
            if self.outbound.send(request.clone()).is_err() {
                debug!(run_id = %self.run_id, "no outbound subscriber");
            }
        }
        if exchange == RemoteExchange::Final {
            return Ok(request.output.unwrap_or(StepOutput {
                output: Value::Null,
                success: true,
            }));
        }
        let outputs = self.collect_round().await?;
        debug!(run_id = %self.run_id, step = request.step, sites = outputs.len(), "round complete");
        Ok(StepOutput {
            output: Value::Object(outputs),
            success: false,
        })
    }
}
