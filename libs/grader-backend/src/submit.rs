/// Submit Wrappers
///
/// **Core Responsibility:**
/// Alternatives to the callback form of `JobManager::submit` for callers
/// that would rather wait or poll:
/// - `SyncSubmitter`: returns the final result directly (async or blocking)
/// - `BufferedSubmitter`: keeps results until the caller collects them by id
use crate::manager::JobManager;
use grader_common::task::GradingTask;
use grader_common::types::{FinalResult, JobId, SubmissionInput};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct SyncSubmitter {
    manager: Arc<JobManager>,
}

impl SyncSubmitter {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    pub async fn submit(&self, task: Arc<dyn GradingTask>, input: SubmissionInput, debug: bool) -> FinalResult {
        self.manager.submit_job(task, input, debug).await
    }

    /// For threads outside the runtime; panics if called from async context
    pub fn submit_blocking(&self, task: Arc<dyn GradingTask>, input: SubmissionInput, debug: bool) -> FinalResult {
        self.manager.submit_job(task, input, debug).wait_blocking()
    }
}

/// `None` while the job runs, `Some` once its result arrived
type ResultTable = Arc<Mutex<HashMap<JobId, Option<FinalResult>>>>;

#[derive(Clone)]
pub struct BufferedSubmitter {
    manager: Arc<JobManager>,
    results: ResultTable,
}

impl BufferedSubmitter {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            results: Arc::default(),
        }
    }

    pub fn submit(&self, task: Arc<dyn GradingTask>, input: SubmissionInput, debug: bool) -> JobId {
        let results = Arc::clone(&self.results);
        let id = self.manager.submit(task, input, debug, move |result| {
            results.lock().insert(result.job_id, Some(result));
        });
        // A result may already be there
        self.results.lock().entry(id).or_insert(None);
        id
    }

    pub fn is_running(&self, id: JobId) -> bool {
        matches!(self.results.lock().get(&id), Some(None))
    }

    pub fn is_done(&self, id: JobId) -> bool {
        matches!(self.results.lock().get(&id), Some(Some(_)))
    }

    /// Returns a finished result once, then forgets the job
    pub fn get_result(&self, id: JobId) -> Option<FinalResult> {
        let mut table = self.results.lock();
        match table.get(&id) {
            Some(Some(_)) => table.remove(&id).flatten(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionBackend, Reservation};
    use anyhow::Result;
    use async_trait::async_trait;
    use grader_common::protocol::NewJobRequest;
    use grader_common::task::TaskDescriptor;
    use grader_common::types::{RawResult, ResultKind};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    /// Holds every job until released
    struct GatedBackend {
        gate: Notify,
        slots: Arc<Semaphore>,
    }

    #[async_trait]
    impl ExecutionBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn reserve(&self) -> Result<Reservation> {
            let permit = Arc::clone(&self.slots).acquire_owned().await?;
            Ok(Reservation::new(0, vec![permit]))
        }

        async fn execute(&self, _reservation: &Reservation, _request: NewJobRequest) -> Result<RawResult> {
            self.gate.notified().await;
            Ok(RawResult::new(ResultKind::Success))
        }
    }

    fn code_task() -> Arc<dyn GradingTask> {
        let mut task: TaskDescriptor =
            serde_json::from_value(json!({"problems": [{"id": "code", "type": "code"}]})).unwrap();
        task.course_id = "course".to_string();
        task.task_id = "task".to_string();
        Arc::new(task)
    }

    fn gated_manager() -> (Arc<GatedBackend>, Arc<JobManager>) {
        let backend = Arc::new(GatedBackend {
            gate: Notify::new(),
            slots: Arc::new(Semaphore::new(4)),
        });
        let manager = JobManager::start(backend.clone(), Duration::from_secs(30));
        (backend, Arc::new(manager))
    }

    #[tokio::test]
    async fn test_buffered_result_is_consumed_once() {
        let (backend, manager) = gated_manager();
        let submitter = BufferedSubmitter::new(manager);

        let id = submitter.submit(code_task(), SubmissionInput::new(), false);
        assert!(submitter.is_running(id));
        assert!(!submitter.is_done(id));
        assert!(submitter.get_result(id).is_none());

        // Let the job reach the backend before opening the gate
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.gate.notify_waiters();
        for _ in 0..100 {
            if submitter.is_done(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(submitter.is_done(id));
        assert!(!submitter.is_running(id));

        let result = submitter.get_result(id).unwrap();
        assert_eq!(result.job_id, id);
        assert_eq!(result.kind(), ResultKind::Success);

        assert!(submitter.get_result(id).is_none());
        assert!(!submitter.is_done(id));
        assert!(!submitter.is_running(id));
    }

    #[tokio::test]
    async fn test_buffered_unknown_id() {
        let (_backend, manager) = gated_manager();
        let submitter = BufferedSubmitter::new(manager);
        let unknown = uuid::Uuid::new_v4();
        assert!(!submitter.is_running(unknown));
        assert!(!submitter.is_done(unknown));
        assert!(submitter.get_result(unknown).is_none());
    }

    #[tokio::test]
    async fn test_sync_submit_waits_for_result() {
        let (backend, manager) = gated_manager();
        let submitter = SyncSubmitter::new(manager);

        let pending = tokio::spawn({
            let submitter = submitter.clone();
            async move { submitter.submit(code_task(), SubmissionInput::new(), false).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        backend.gate.notify_waiters();
        let result = pending.await.unwrap();
        assert_eq!(result.kind(), ResultKind::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_submit_from_plain_thread() {
        let (backend, manager) = gated_manager();
        let submitter = SyncSubmitter::new(manager);

        let waiter = std::thread::spawn(move || submitter.submit_blocking(code_task(), SubmissionInput::new(), false));
        tokio::time::sleep(Duration::from_millis(100)).await;
        backend.gate.notify_waiters();

        let result = tokio::task::spawn_blocking(move || waiter.join().unwrap())
            .await
            .unwrap();
        assert_eq!(result.kind(), ResultKind::Success);
    }
}
