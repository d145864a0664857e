// In-process execution: one Agent shared by every job, bounded by its concurrency
use crate::backend::{ExecutionBackend, Reservation};
use anyhow::{Context, Result};
use async_trait::async_trait;
use grader_agent::Agent;
use grader_common::protocol::NewJobRequest;
use grader_common::types::RawResult;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct LocalBackend {
    agent: Arc<Agent>,
    slots: Arc<Semaphore>,
}

impl LocalBackend {
    pub fn new(agent: Arc<Agent>) -> Self {
        let slots = Arc::new(Semaphore::new(agent.concurrency()));
        Self { agent, slots }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn reserve(&self) -> Result<Reservation> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .context("Local agent is shut down")?;
        Ok(Reservation::new(0, vec![permit]))
    }

    async fn execute(&self, _reservation: &Reservation, request: NewJobRequest) -> Result<RawResult> {
        Ok(self.agent.run_job(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::JobManager;
    use crate::test_support::write_task;
    use grader_agent::fake::{FakeBehavior, FakeRuntime};
    use grader_common::config::GraderConfig;
    use grader_common::task::{GradingTask, TaskDescriptor};
    use grader_common::types::{ResultKind, SubmissionInput};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: GraderConfig,
        fake: FakeRuntime,
        manager: JobManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = GraderConfig::default();
        config.tasks_directory = dir.path().join("tasks");
        config.agent.tmp_dir = dir.path().join("tmp");
        config.image_aliases = BTreeMap::from([("python".to_string(), "grader/python".to_string())]);
        write_task(
            &config.tasks_directory,
            "mixed",
            json!({
                "environment": "python",
                "limits": {"time": 1, "hard_time": 2},
                "problems": [
                    {"id": "code", "type": "code"},
                    {"id": "answer", "type": "match", "answer": "42"}
                ]
            }),
        );

        let fake = FakeRuntime::new();
        let agent = Agent::new(Arc::new(fake.clone()), &config);
        let manager = JobManager::start(Arc::new(LocalBackend::new(agent)), Duration::from_secs(5));
        Fixture {
            _dir: dir,
            config,
            fake,
            manager,
        }
    }

    fn task(config: &GraderConfig) -> Arc<dyn GradingTask> {
        Arc::new(TaskDescriptor::load(&config.tasks_directory, "course", "mixed").unwrap())
    }

    fn input(answer: &str) -> SubmissionInput {
        SubmissionInput::from([
            ("code".to_string(), json!("print(42)")),
            ("answer".to_string(), json!(answer)),
        ])
    }

    #[tokio::test]
    async fn test_submission_runs_in_local_agent() {
        let f = fixture();
        f.fake.script(
            "grader/python",
            FakeBehavior::reporting(&RawResult::with_text(ResultKind::Success, "All tests passed")),
        );

        let result = f.manager.submit_job(task(&f.config), input("42"), false).await;
        assert_eq!(result.kind(), ResultKind::Success);
        assert_eq!(result.text(), "All tests passed");
        assert_eq!(f.fake.created().len(), 1);
        assert_eq!(f.fake.live(), 0);
    }

    #[tokio::test]
    async fn test_wrong_local_answer_fails_despite_sandbox_success() {
        let f = fixture();
        f.fake.script("grader/python", FakeBehavior::reporting(&RawResult::new(ResultKind::Success)));

        let result = f.manager.submit_job(task(&f.config), input("41"), false).await;
        assert_eq!(result.kind(), ResultKind::Failed);
    }

    #[tokio::test]
    async fn test_runaway_submission_times_out() {
        let f = fixture();
        f.fake.script("grader/python", FakeBehavior::hanging(Duration::ZERO));

        let result = f.manager.submit_job(task(&f.config), input("42"), false).await;
        assert_eq!(result.kind(), ResultKind::Timeout);
        assert_eq!(f.fake.live(), 0);
    }
}
