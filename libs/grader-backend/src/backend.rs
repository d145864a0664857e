/// Execution Backends - Where Sandboxed Jobs Actually Run
///
/// **Core Responsibility:**
/// Give the JobManager one seam over the three ways of reaching an Agent:
/// - `LocalBackend`: an in-process Agent
/// - `RemotePoolBackend`: a fixed set of agent connections behind a
///   free-connection semaphore
/// - `RemoteManualBackend`: a static list of agents with health tracking,
///   periodic reconnection and task synchronisation
///
/// **Two-Step Contract:**
/// 1. `reserve` runs in the dispatch loop and may block until capacity frees
///    up; this is the backpressure point
/// 2. `execute` runs in the job's own task while holding the reservation
use crate::client::AgentClient;
use crate::manual::RemoteManualBackend;
use crate::pool::RemotePoolBackend;
use crate::local::LocalBackend;
use anyhow::{bail, Result};
use async_trait::async_trait;
use grader_agent::{Agent, ContainerRuntime};
use grader_common::config::{BackendMode, GraderConfig};
use grader_common::protocol::NewJobRequest;
use grader_common::types::RawResult;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

pub const NO_AGENT_TEXT: &str = "There are not any agent available for grading. Please retry later. If this error persists, please contact the course administrator.";

/// Capacity held for one job; released on drop
#[derive(Debug)]
pub struct Reservation {
    /// Index of the chosen agent within the backend
    pub agent: usize,
    _permits: Vec<OwnedSemaphorePermit>,
}

impl Reservation {
    pub fn new(agent: usize, permits: Vec<OwnedSemaphorePermit>) -> Self {
        Self {
            agent,
            _permits: permits,
        }
    }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Wait for capacity. An error means no agent can take the job at all.
    async fn reserve(&self) -> Result<Reservation>;

    async fn execute(&self, reservation: &Reservation, request: NewJobRequest) -> Result<RawResult>;

    /// Stop background work (reconnect and sync loops)
    fn close(&self) {}
}

/// Build the backend selected by `backend.mode`. Local mode runs its Agent
/// on `runtime`, which is required in that mode.
pub async fn from_config(
    config: &GraderConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
) -> Result<Arc<dyn ExecutionBackend>> {
    match config.backend.mode {
        BackendMode::Local => {
            let Some(runtime) = runtime else {
                bail!("Local backend requires a container runtime");
            };
            Ok(Arc::new(LocalBackend::new(Agent::new(runtime, config))))
        }
        BackendMode::RemotePool => {
            let clients = config.backend.agents.iter().map(|url| AgentClient::new(url)).collect();
            Ok(Arc::new(RemotePoolBackend::new(clients)))
        }
        BackendMode::RemoteManual => {
            let backend = RemoteManualBackend::start(config).await;
            Ok(backend)
        }
    }
}
