/// Remote-Manual Backend - Static Agent List With Health Tracking
///
/// **Core Responsibility:**
/// Dispatch jobs round-robin over the configured agents that are currently
/// connected and synchronised, never more at once than an agent's reported
/// concurrency.
///
/// **Agent Lifecycle:**
/// Disconnected → (info, alias push, task sync) → Ready
/// - A reconnect loop retries disconnected agents every `reconnect_interval`
/// - A sync loop re-synchronises ready agents every `sync_interval`
/// - A transport failure marks the agent disconnected; every job in flight
///   on it ends with a "Remote agent shutdown" crash
/// - A job whose request never reached its agent moves to the next agent
///   with a free slot
///
/// **Capacity:**
/// Each agent gets a semaphore sized from `AgentInfo.concurrency` when it
/// connects. `reserve` blocks the dispatch loop until a ready agent has a
/// free permit, so a job's deadline only starts once the agent can run it.
/// Disconnecting closes the semaphore, which wakes any waiting `reserve`.
use crate::backend::{ExecutionBackend, Reservation, NO_AGENT_TEXT};
use crate::client::{AgentClient, AgentError};
use crate::syncer::{self, SyncOutcome};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use grader_common::config::GraderConfig;
use grader_common::protocol::NewJobRequest;
use grader_common::types::RawResult;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use futures_util::future::select_all;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const AGENT_SHUTDOWN_TEXT: &str = "Remote agent shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentHealth {
    Disconnected,
    Ready,
}

struct ManagedAgent {
    client: AgentClient,
    health: RwLock<AgentHealth>,
    /// Bumped on every disconnect so in-flight jobs notice
    generation: watch::Sender<u64>,
    /// Serialises connect and sync of this agent
    busy: tokio::sync::Mutex<()>,
    /// Replaced on every connect
    slots: RwLock<Arc<Semaphore>>,
}

impl ManagedAgent {
    fn slots(&self) -> Arc<Semaphore> {
        self.slots.read().clone()
    }
}

pub struct RemoteManualBackend {
    agents: Vec<ManagedAgent>,
    next: AtomicUsize,
    /// Signalled whenever an agent becomes ready
    connected: Notify,
    aliases: BTreeMap<String, String>,
    tasks_directory: PathBuf,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteManualBackend {
    fn new(config: &GraderConfig) -> Self {
        let agents = config
            .backend
            .agents
            .iter()
            .map(|url| ManagedAgent {
                client: AgentClient::new(url),
                health: RwLock::new(AgentHealth::Disconnected),
                generation: watch::channel(0).0,
                busy: tokio::sync::Mutex::new(()),
                slots: RwLock::new(Arc::new(Semaphore::new(0))),
            })
            .collect();
        Self {
            agents,
            next: AtomicUsize::new(0),
            connected: Notify::new(),
            aliases: config.image_aliases.clone(),
            tasks_directory: config.tasks_directory.clone(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Connect every agent once, then keep them connected and synchronised
    /// in the background
    pub async fn start(config: &GraderConfig) -> Arc<Self> {
        let backend = Arc::new(Self::new(config));
        backend.connect_all().await;

        let reconnect = tokio::spawn(periodic(
            Arc::downgrade(&backend),
            config.backend.reconnect_interval(),
            |backend| async move { backend.connect_all().await },
        ));
        let sync = tokio::spawn(periodic(
            Arc::downgrade(&backend),
            config.backend.sync_interval(),
            |backend| async move { backend.sync_all().await },
        ));
        backend.loops.lock().extend([reconnect, sync]);
        backend
    }

    pub fn health(&self, index: usize) -> Option<AgentHealth> {
        self.agents.get(index).map(|agent| *agent.health.read())
    }

    pub fn ready_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|agent| *agent.health.read() == AgentHealth::Ready)
            .count()
    }

    pub async fn connect_all(&self) {
        for index in 0..self.agents.len() {
            if self.health(index) == Some(AgentHealth::Disconnected) {
                self.connect(index).await;
            }
        }
    }

    async fn connect(&self, index: usize) {
        let agent = &self.agents[index];
        let _busy = agent.busy.lock().await;
        if *agent.health.read() == AgentHealth::Ready {
            return;
        }

        match self.handshake(&agent.client).await {
            Ok((outcome, concurrency)) => {
                *agent.slots.write() = Arc::new(Semaphore::new(concurrency.max(1)));
                *agent.health.write() = AgentHealth::Ready;
                info!(endpoint = %agent.client.endpoint(), ?outcome, concurrency, "Agent connected");
                self.connected.notify_waiters();
            }
            Err(e) => {
                warn!(endpoint = %agent.client.endpoint(), error = %format!("{:#}", e), "Cannot connect to agent");
            }
        }
    }

    /// Returns the sync outcome and the agent's concurrency
    async fn handshake(&self, client: &AgentClient) -> Result<(SyncOutcome, usize)> {
        let info = client.info().await?;
        client.update_aliases(&self.aliases).await?;
        if !info.sync_enabled {
            return Ok((SyncOutcome::Skipped, info.concurrency));
        }
        let outcome = syncer::sync_agent(client, &self.tasks_directory).await?;
        Ok((outcome, info.concurrency))
    }

    pub async fn sync_all(&self) {
        for (index, agent) in self.agents.iter().enumerate() {
            if *agent.health.read() != AgentHealth::Ready {
                continue;
            }
            let result = {
                let _busy = agent.busy.lock().await;
                syncer::sync_agent(&agent.client, &self.tasks_directory).await
            };
            if let Err(e) = result {
                warn!(endpoint = %agent.client.endpoint(), error = %format!("{:#}", e), "Task synchronisation failed");
                self.mark_disconnected(index);
            }
        }
    }

    fn mark_disconnected(&self, index: usize) {
        let agent = &self.agents[index];
        let was_ready = {
            let mut health = agent.health.write();
            let was_ready = *health == AgentHealth::Ready;
            *health = AgentHealth::Disconnected;
            was_ready
        };
        if was_ready {
            warn!(endpoint = %agent.client.endpoint(), "Agent disconnected");
            agent.slots.read().close();
            agent.generation.send_modify(|generation| *generation += 1);
        }
    }

    fn ready_agents(&self) -> Vec<usize> {
        (0..self.agents.len())
            .filter(|&index| self.health(index) == Some(AgentHealth::Ready))
            .collect()
    }

    /// Round-robin over `ready`, taking the first free slot without waiting
    fn try_reserve(&self, ready: &[usize]) -> Option<Reservation> {
        if ready.is_empty() {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..ready.len())
            .map(|offset| ready[(start + offset) % ready.len()])
            .find_map(|index| {
                let permit = self.agents[index].slots().try_acquire_owned().ok()?;
                Some(Reservation::new(index, vec![permit]))
            })
    }
}

/// Run `tick` every `interval` for as long as the backend exists
async fn periodic<F, Fut>(backend: Weak<RemoteManualBackend>, interval: Duration, tick: F)
where
    F: Fn(Arc<RemoteManualBackend>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(backend) = backend.upgrade() else {
            break;
        };
        tick(backend).await;
    }
}

#[async_trait]
impl ExecutionBackend for RemoteManualBackend {
    fn name(&self) -> &'static str {
        "remote_manual"
    }

    async fn reserve(&self) -> Result<Reservation> {
        loop {
            let connected = self.connected.notified();
            tokio::pin!(connected);
            connected.as_mut().enable();

            let ready = self.ready_agents();
            if ready.is_empty() {
                bail!(NO_AGENT_TEXT);
            }
            if let Some(reservation) = self.try_reserve(&ready) {
                return Ok(reservation);
            }

            let waits = ready.iter().map(|&index| {
                let slots = self.agents[index].slots();
                Box::pin(async move { (index, slots.acquire_owned().await) })
            });
            tokio::select! {
                ((index, permit), _, _) = select_all(waits) => {
                    // A closed semaphore means the agent went away: look again
                    if let Ok(permit) = permit {
                        if self.health(index) == Some(AgentHealth::Ready) {
                            return Ok(Reservation::new(index, vec![permit]));
                        }
                    }
                }
                _ = &mut connected => {}
            }
        }
    }

    async fn execute(&self, reservation: &Reservation, request: NewJobRequest) -> Result<RawResult> {
        let mut index = reservation.agent;
        let mut attempts = 1;
        // Slot on the agent a job moved to; the original reservation stays held
        let mut _moved: Option<Reservation> = None;
        loop {
            let agent = &self.agents[index];
            let mut generation = agent.generation.subscribe();
            let outcome = tokio::select! {
                result = agent.client.new_job(&request) => Some(result),
                _ = generation.changed() => None,
            };

            match outcome {
                Some(Ok(result)) => return Ok(result),
                Some(Err(e @ AgentError::Rejected { .. })) => {
                    return Err(anyhow!(e).context(AGENT_SHUTDOWN_TEXT));
                }
                Some(Err(e)) => {
                    self.mark_disconnected(index);
                    if !e.is_unreachable() || attempts >= self.agents.len() {
                        return Err(anyhow!(e).context(AGENT_SHUTDOWN_TEXT));
                    }
                    let ready = self.ready_agents();
                    if ready.is_empty() {
                        bail!(NO_AGENT_TEXT);
                    }
                    let Some(next) = self.try_reserve(&ready) else {
                        return Err(anyhow!(e).context(AGENT_SHUTDOWN_TEXT));
                    };
                    warn!(job_id = %request.job_id, endpoint = %agent.client.endpoint(), "Agent unreachable, trying another one");
                    index = next.agent;
                    _moved = Some(next);
                    attempts += 1;
                }
                None => bail!(AGENT_SHUTDOWN_TEXT),
            }
        }
    }

    fn close(&self) {
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::JobManager;
    use crate::test_support::{free_port_url, spawn_agent, spawn_configured, write_task};
    use grader_agent::fake::{FakeBehavior, FakeRuntime};
    use grader_common::config::BackendMode;
    use grader_common::task::{GradingTask, TaskDescriptor};
    use grader_common::types::{ResultKind, SubmissionInput};
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn config(master: &TempDir, agents: Vec<String>) -> GraderConfig {
        let mut config = GraderConfig::default();
        config.tasks_directory = master.path().to_path_buf();
        config.image_aliases = BTreeMap::from([("python".to_string(), "grader/python".to_string())]);
        config.backend.mode = BackendMode::RemoteManual;
        config.backend.agents = agents;
        config
    }

    fn request(task_id: &str) -> NewJobRequest {
        NewJobRequest {
            job_id: Uuid::new_v4(),
            course_id: "course".to_string(),
            task_id: task_id.to_string(),
            input: BTreeMap::new(),
            debug: false,
        }
    }

    #[tokio::test]
    async fn test_connect_pushes_aliases_and_tasks() {
        let master = TempDir::new().unwrap();
        write_task(master.path(), "hello", json!({"environment": "python", "problems": [{"id": "q", "type": "code"}]}));

        let fake = FakeRuntime::new();
        fake.script(
            "grader/python",
            FakeBehavior::reporting(&RawResult::new(ResultKind::Success)),
        );
        let remote = spawn_agent(fake.clone(), BTreeMap::new()).await;

        let backend = RemoteManualBackend::start(&config(&master, vec![remote.url.clone()])).await;
        assert_eq!(backend.health(0), Some(AgentHealth::Ready));
        assert!(remote.tasks().join("course/hello/task.json").is_file());
        assert_eq!(remote.agent.resolve_image("python").as_deref(), Some("grader/python"));

        let reservation = backend.reserve().await.unwrap();
        let result = backend.execute(&reservation, request("hello")).await.unwrap();
        assert_eq!(result.kind, ResultKind::Success);
        backend.close();
    }

    #[tokio::test]
    async fn test_round_robin_over_ready_agents() {
        let master = TempDir::new().unwrap();
        let first = spawn_agent(FakeRuntime::new(), BTreeMap::new()).await;
        let second = spawn_agent(FakeRuntime::new(), BTreeMap::new()).await;

        let backend =
            RemoteManualBackend::start(&config(&master, vec![first.url.clone(), second.url.clone()])).await;
        assert_eq!(backend.ready_count(), 2);

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(backend.reserve().await.unwrap());
        }
        let picks: Vec<usize> = held.iter().map(|reservation| reservation.agent).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
        backend.close();
    }

    #[tokio::test]
    async fn test_unreachable_agents_are_not_dispatched_to() {
        let master = TempDir::new().unwrap();
        let backend = RemoteManualBackend::start(&config(&master, vec![free_port_url().await])).await;

        assert_eq!(backend.health(0), Some(AgentHealth::Disconnected));
        let err = backend.reserve().await.unwrap_err();
        assert_eq!(err.to_string(), NO_AGENT_TEXT);
        backend.close();
    }

    #[tokio::test]
    async fn test_failed_dispatch_moves_to_next_agent() {
        let master = TempDir::new().unwrap();
        write_task(master.path(), "hello", json!({"environment": "python"}));
        let fake = FakeRuntime::new();
        fake.script(
            "grader/python",
            FakeBehavior::reporting(&RawResult::new(ResultKind::Failed)),
        );
        let doomed = spawn_agent(FakeRuntime::new(), BTreeMap::new()).await;
        let healthy = spawn_agent(fake, BTreeMap::new()).await;

        let backend =
            RemoteManualBackend::start(&config(&master, vec![doomed.url.clone(), healthy.url.clone()])).await;
        assert_eq!(backend.ready_count(), 2);
        doomed.stop().await;

        let reservation = backend.reserve().await.unwrap();
        assert_eq!(reservation.agent, 0);
        let result = backend.execute(&reservation, request("hello")).await.unwrap();
        assert_eq!(result.kind, ResultKind::Failed);
        assert_eq!(backend.health(0), Some(AgentHealth::Disconnected));
        assert_eq!(backend.health(1), Some(AgentHealth::Ready));
        backend.close();
    }

    #[tokio::test]
    async fn test_reserve_waits_for_agent_concurrency() {
        let master = TempDir::new().unwrap();
        let remote = spawn_configured(FakeRuntime::new(), |config| config.agent.concurrency = 1).await;
        let backend = RemoteManualBackend::start(&config(&master, vec![remote.url.clone()])).await;

        let first = backend.reserve().await.unwrap();
        let second = tokio::spawn({
            let backend = Arc::clone(&backend);
            async move { backend.reserve().await.map(|reservation| reservation.agent) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());

        drop(first);
        assert_eq!(second.await.unwrap().unwrap(), 0);
        backend.close();
    }

    #[tokio::test]
    async fn test_queued_jobs_get_their_full_deadline() {
        let master = TempDir::new().unwrap();
        write_task(
            master.path(),
            "slow",
            json!({
                "environment": "python",
                "limits": {"time": 1, "hard_time": 2},
                "problems": [{"id": "code", "type": "code"}]
            }),
        );
        let fake = FakeRuntime::new();
        fake.script("grader/python", FakeBehavior::hanging(Duration::ZERO));
        let remote = spawn_configured(fake, |config| config.agent.concurrency = 1).await;

        let backend = RemoteManualBackend::start(&config(&master, vec![remote.url.clone()])).await;
        assert_eq!(backend.ready_count(), 1);
        let manager = JobManager::start(backend.clone(), Duration::from_secs(1));

        let task: Arc<dyn GradingTask> = Arc::new(TaskDescriptor::load(master.path(), "course", "slow").unwrap());
        let first = manager.submit_job(Arc::clone(&task), SubmissionInput::new(), false);
        let second = manager.submit_job(task, SubmissionInput::new(), false);

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.kind(), ResultKind::Timeout);
        assert_eq!(second.kind(), ResultKind::Timeout);
        backend.close();
    }

    #[tokio::test]
    async fn test_sync_failure_disconnects_agent() {
        let master = TempDir::new().unwrap();
        let remote = spawn_agent(FakeRuntime::new(), BTreeMap::new()).await;
        let backend = RemoteManualBackend::start(&config(&master, vec![remote.url.clone()])).await;
        assert_eq!(backend.ready_count(), 1);

        remote.stop().await;
        backend.sync_all().await;
        assert_eq!(backend.health(0), Some(AgentHealth::Disconnected));
        backend.close();
    }
}
