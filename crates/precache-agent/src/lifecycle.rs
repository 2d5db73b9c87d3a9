//! Lifecycle host: drives agents through install and activate and routes
//! fetches to the controlling agent.

use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use hashbrown::HashMap;
use precache_common::{BestEffort, PrecacheError, Result};
use precache_net::{Network, Request};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace};

use crate::agent::{OfflineCacheAgent, ResponseSource, Served};
use crate::FetchError;

/// Agent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Registered, not yet installing.
    #[default]
    Parsed,
    /// Install event dispatched.
    Installing,
    /// Install settled, waiting for activation.
    Installed,
    /// Activate event dispatched.
    Activating,
    /// Controlling fetches.
    Activated,
    /// Replaced by a newer version.
    Redundant,
}

/// An event whose completion can be extended with pending work.
///
/// The event is finished once every future passed to [`wait_until`] has
/// resolved. Outputs are returned in registration order.
///
/// [`wait_until`]: ExtendableEvent::wait_until
pub struct ExtendableEvent<'a, T> {
    kind: &'static str,
    pending: Vec<BoxFuture<'a, T>>,
}

impl<'a, T> ExtendableEvent<'a, T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            pending: Vec::new(),
        }
    }

    /// Event name.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Keep the event open until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = T> + Send + 'a,
    {
        self.pending.push(work.boxed());
    }

    /// Number of registered futures.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for all registered work.
    pub async fn settle(self) -> Vec<T> {
        trace!(event = self.kind, pending = self.pending.len(), "Settling event");
        join_all(self.pending).await
    }
}

/// Host notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// An agent moved to a new state.
    StateChange { version: String, state: WorkerState },
    /// A new agent now controls fetches.
    ControllerChange { version: String },
}

/// Summary of one install-and-activate cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub version: String,
    /// Entries stored during install.
    pub precached: usize,
    /// Whether the precache batch failed and was tolerated.
    pub install_degraded: bool,
    /// Buckets removed during activate.
    pub deleted: Vec<String>,
}

/// Drives agent lifecycles and routes fetches.
pub struct AgentHost {
    network: Arc<dyn Network>,
    controller: RwLock<Option<Arc<OfflineCacheAgent>>>,
    states: RwLock<HashMap<String, WorkerState>>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHost {
    /// Create a host that forwards uncontrolled fetches to `network`.
    pub fn new(network: Arc<dyn Network>) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                network,
                controller: RwLock::new(None),
                states: RwLock::new(HashMap::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Install and activate the first agent.
    pub async fn start(&self, agent: OfflineCacheAgent) -> Result<LifecycleReport> {
        self.replace(agent).await
    }

    /// Install and activate `agent`, retiring the current controller.
    ///
    /// The current controller keeps serving fetches until the new agent has
    /// installed. It is then retired: from activation onwards it answers from
    /// the network only and leaves its old bucket alone.
    pub async fn replace(&self, agent: OfflineCacheAgent) -> Result<LifecycleReport> {
        let agent = Arc::new(agent);
        let version = agent.version().to_string();

        let previous = self.controller.read().await.clone();
        if previous.as_ref().is_some_and(|p| p.version() == version) {
            return Err(PrecacheError::InvalidArgument(format!(
                "version {version} is already active"
            )));
        }

        let mut report = LifecycleReport {
            version: version.clone(),
            ..Default::default()
        };

        self.transition(&version, WorkerState::Parsed).await;
        self.transition(&version, WorkerState::Installing).await;

        let mut install = ExtendableEvent::new("install");
        install.wait_until(agent.install());
        for outcome in install.settle().await {
            match outcome {
                BestEffort::Applied(stored) => report.precached += stored,
                BestEffort::Degraded(_) => report.install_degraded = true,
            }
        }
        self.transition(&version, WorkerState::Installed).await;

        // Fetches already inside the previous agent must not write back into
        // a bucket that activation is about to delete.
        if let Some(previous) = &previous {
            previous.retire();
        }

        self.transition(&version, WorkerState::Activating).await;
        let mut activate = ExtendableEvent::new("activate");
        activate.wait_until(agent.activate());
        for outcome in activate.settle().await {
            if let Some(deleted) = outcome.applied() {
                report.deleted.extend(deleted);
            }
        }

        *self.controller.write().await = Some(agent);
        if let Some(previous) = previous {
            self.transition(previous.version(), WorkerState::Redundant).await;
        }
        self.transition(&version, WorkerState::Activated).await;
        let _ = self.event_tx.send(AgentEvent::ControllerChange {
            version: version.clone(),
        });

        info!(
            version = %version,
            precached = report.precached,
            degraded = report.install_degraded,
            deleted = report.deleted.len(),
            "Agent controlling"
        );
        Ok(report)
    }

    /// Route a fetch through the controlling agent, or to the network when
    /// no agent is active.
    pub async fn fetch(&self, request: &Request) -> std::result::Result<Served, FetchError> {
        let controller = self.controller.read().await.clone();
        match controller {
            Some(agent) => agent.handle_fetch(request).await,
            None => {
                trace!(url = %request.url, "Uncontrolled fetch");
                let response = self.network.fetch(request).await?;
                Ok(Served {
                    response,
                    source: ResponseSource::Network,
                })
            }
        }
    }

    /// State of the agent with `version`, if it was ever registered.
    pub async fn state(&self, version: &str) -> Option<WorkerState> {
        self.states.read().await.get(version).copied()
    }

    /// Version of the controlling agent.
    pub async fn controller(&self) -> Option<String> {
        self.controller
            .read()
            .await
            .as_ref()
            .map(|agent| agent.version().to_string())
    }

    async fn transition(&self, version: &str, state: WorkerState) {
        self.states.write().await.insert(version.to_string(), state);
        debug!(version, ?state, "Agent state changed");
        let _ = self.event_tx.send(AgentEvent::StateChange {
            version: version.to_string(),
            state,
        });
    }
}
