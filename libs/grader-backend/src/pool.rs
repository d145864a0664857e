// Fixed pool of agent connections. Every configured endpoint entry is one
// connection that runs one job at a time. These are logical slots: each RPC
// still opens its own TCP connection (see `AgentClient::new`).
use crate::backend::{ExecutionBackend, Reservation};
use crate::client::AgentClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use grader_common::protocol::NewJobRequest;
use grader_common::types::RawResult;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

struct Connection {
    client: AgentClient,
    busy: Arc<Semaphore>,
}

pub struct RemotePoolBackend {
    connections: Vec<Connection>,
    free: Arc<Semaphore>,
}

impl RemotePoolBackend {
    pub fn new(clients: Vec<AgentClient>) -> Self {
        let free = Arc::new(Semaphore::new(clients.len()));
        let connections = clients
            .into_iter()
            .map(|client| Connection {
                client,
                busy: Arc::new(Semaphore::new(1)),
            })
            .collect();
        Self { connections, free }
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl ExecutionBackend for RemotePoolBackend {
    fn name(&self) -> &'static str {
        "remote_pool"
    }

    async fn reserve(&self) -> Result<Reservation> {
        if self.connections.is_empty() {
            anyhow::bail!(crate::backend::NO_AGENT_TEXT);
        }
        let free = Arc::clone(&self.free)
            .acquire_owned()
            .await
            .context("Connection pool is shut down")?;

        // Holding a `free` permit guarantees at least one idle connection
        for (index, connection) in self.connections.iter().enumerate() {
            if let Ok(busy) = Arc::clone(&connection.busy).try_acquire_owned() {
                debug!(connection = index, endpoint = %connection.client.endpoint(), "Connection reserved");
                return Ok(Reservation::new(index, vec![busy, free]));
            }
        }
        anyhow::bail!("No idle connection despite a free slot")
    }

    async fn execute(&self, reservation: &Reservation, request: NewJobRequest) -> Result<RawResult> {
        let connection = self
            .connections
            .get(reservation.agent)
            .context("Reservation for an unknown connection")?;
        Ok(connection.client.new_job(&request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reserve_blocks_until_a_connection_frees() {
        let pool = Arc::new(RemotePoolBackend::new(vec![
            AgentClient::new("http://127.0.0.1:1"),
            AgentClient::new("http://127.0.0.1:2/"),
        ]));
        let first = pool.reserve().await.unwrap();
        let second = pool.reserve().await.unwrap();
        assert_ne!(first.agent, second.agent);

        let waiting = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.reserve().await.map(|r| r.agent) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let released = second.agent;
        drop(second);
        assert_eq!(waiting.await.unwrap().unwrap(), released);
        drop(first);
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_agent() {
        let pool = RemotePoolBackend::new(Vec::new());
        assert!(pool.reserve().await.is_err());
    }
}

#[cfg(test)]
mod remote_tests {
    use super::*;
    use crate::manager::JobManager;
    use crate::test_support::{free_port_url, spawn_agent, write_task};
    use grader_agent::fake::{FakeBehavior, FakeRuntime};
    use grader_common::task::{GradingTask, TaskDescriptor};
    use grader_common::types::{ResultKind, SubmissionInput};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn code_task() -> Arc<dyn GradingTask> {
        let mut task: TaskDescriptor = serde_json::from_value(json!({
            "environment": "python",
            "problems": [{"id": "code", "type": "code"}]
        }))
        .unwrap();
        task.course_id = "course".to_string();
        task.task_id = "hello".to_string();
        Arc::new(task)
    }

    #[tokio::test]
    async fn test_jobs_run_on_pooled_agent() {
        let fake = FakeRuntime::new();
        fake.script(
            "grader/python",
            FakeBehavior::reporting(&RawResult::with_text(ResultKind::Failed, "Wrong output on test 2")),
        );
        let aliases = BTreeMap::from([("python".to_string(), "grader/python".to_string())]);
        let remote = spawn_agent(fake.clone(), aliases).await;
        write_task(&remote.tasks(), "hello", json!({"environment": "python"}));

        let pool = RemotePoolBackend::new(vec![AgentClient::new(&remote.url), AgentClient::new(&remote.url)]);
        let manager = JobManager::start(Arc::new(pool), Duration::from_secs(5));

        let handles: Vec<_> = (0..3)
            .map(|_| manager.submit_job(code_task(), SubmissionInput::new(), false))
            .collect();
        for handle in handles {
            let result = handle.await;
            assert_eq!(result.kind(), ResultKind::Failed);
            assert_eq!(result.text(), "Wrong output on test 2");
        }
        assert_eq!(fake.created().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_pool_agent_crashes_job() {
        let pool = RemotePoolBackend::new(vec![AgentClient::new(&free_port_url().await)]);
        let manager = JobManager::start(Arc::new(pool), Duration::from_secs(5));

        let result = manager.submit_job(code_task(), SubmissionInput::new(), false).await;
        assert_eq!(result.kind(), ResultKind::Crash);
        assert!(result.text().contains("unreachable"));
    }
}
