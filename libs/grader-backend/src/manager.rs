/// Job Manager - Submission, Dispatch and Delivery
///
/// **Core Responsibility:**
/// Accept submissions without blocking the caller, dispatch them in FIFO
/// order to an execution backend, merge the sandbox result with the local
/// answer check and deliver exactly one final result per job.
///
/// **Dispatch Loop:**
/// 1. Pop the oldest job
/// 2. Check the answer locally; jobs without sandboxed problems finish here
/// 3. Reserve backend capacity (blocks the loop, never the caller)
/// 4. Run the job in its own task, bounded by `hard_time + overhead`
///
/// **Failure Handling:**
/// Backend errors, panics and overruns all become `crash` results. The loop
/// itself never fails.
use crate::backend::ExecutionBackend;
use crate::queue::{Callback, Job, JobQueue, ResultSlot};
pub use crate::queue::ABANDONED_TEXT;
use futures_util::FutureExt;
use grader_common::merge::merge;
use grader_common::protocol::NewJobRequest;
use grader_common::task::GradingTask;
use grader_common::types::{FinalResult, JobId, LocalCheck, RawResult, SubmissionInput};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const AGENT_TIMEOUT_TEXT: &str = "The grading agent did not answer in time. Please retry later.";
pub const INTERNAL_CRASH_TEXT: &str = "An internal error occurred while grading your submission";

pub struct JobManager {
    queue: Arc<JobQueue>,
    backend: Arc<dyn ExecutionBackend>,
    dispatcher: JoinHandle<()>,
    closed: AtomicBool,
}

/// Resolves to the final result of one submission
pub struct JobHandle {
    job_id: JobId,
    course_id: String,
    task_id: String,
    receiver: oneshot::Receiver<FinalResult>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    fn lost(&self) -> FinalResult {
        let verdict = merge(&LocalCheck::default(), Some(RawResult::crash(INTERNAL_CRASH_TEXT)));
        FinalResult::new(self.job_id, &self.course_id, &self.task_id, verdict)
    }

    /// Block the current (non-async) thread until the result arrives
    pub fn wait_blocking(self) -> FinalResult {
        let lost = self.lost();
        self.receiver.blocking_recv().unwrap_or(lost)
    }
}

impl Future for JobHandle {
    type Output = FinalResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<FinalResult> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(self.lost()),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn final_result(job: &Job, local: &LocalCheck, raw: Option<RawResult>) -> FinalResult {
    FinalResult::new(job.id, job.task.course_id(), job.task.task_id(), merge(local, raw))
}

impl JobManager {
    /// Start the dispatch loop on the current runtime
    pub fn start(backend: Arc<dyn ExecutionBackend>, supervision_overhead: Duration) -> Self {
        let queue = Arc::new(JobQueue::new());
        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&queue),
            Arc::clone(&backend),
            supervision_overhead,
        ));
        info!(backend = backend.name(), "Job manager started");
        Self {
            queue,
            backend,
            dispatcher,
            closed: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, task: Arc<dyn GradingTask>, input: SubmissionInput, debug: bool, slot: ResultSlot, id: JobId) {
        info!(job_id = %id, course = task.course_id(), task = task.task_id(), "Job submitted");
        let job = Job {
            id,
            task,
            input,
            debug,
            slot,
        };
        if self.closed.load(Ordering::Acquire) {
            // Dropping answers it with the shutdown crash
            drop(job);
            return;
        }
        self.queue.push(job);
    }

    /// Queue a job; `callback` runs exactly once with its final result
    pub fn submit<F>(&self, task: Arc<dyn GradingTask>, input: SubmissionInput, debug: bool, callback: F) -> JobId
    where
        F: FnOnce(FinalResult) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let callback: Callback = Box::new(callback);
        self.enqueue(task, input, debug, ResultSlot::callback(id, callback), id);
        id
    }

    /// Queue a job and get a future of its final result
    pub fn submit_job(&self, task: Arc<dyn GradingTask>, input: SubmissionInput, debug: bool) -> JobHandle {
        let id = Uuid::new_v4();
        let (slot, receiver) = ResultSlot::channel(id);
        let handle = JobHandle {
            job_id: id,
            course_id: task.course_id().to_string(),
            task_id: task.task_id().to_string(),
            receiver,
        };
        self.enqueue(task, input, debug, slot, id);
        handle
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Stop dispatching. Jobs not yet running receive a crash result; jobs
    /// already running finish on their own.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.dispatcher.abort();
        self.backend.close();
        let abandoned = self.queue.drain();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "Abandoning queued jobs");
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_loop(queue: Arc<JobQueue>, backend: Arc<dyn ExecutionBackend>, overhead: Duration) {
    loop {
        let job = queue.pop().await;
        dispatch(&backend, job, overhead).await;
    }
}

#[instrument(skip_all, fields(job_id = %job.id))]
async fn dispatch(backend: &Arc<dyn ExecutionBackend>, job: Job, overhead: Duration) {
    let checked = std::panic::catch_unwind(AssertUnwindSafe(|| job.task.check_answer(&job.input)));
    let local = match checked {
        Ok(local) => local,
        Err(_) => {
            error!("Local answer check panicked");
            let result = final_result(&job, &LocalCheck::default(), Some(RawResult::crash(INTERNAL_CRASH_TEXT)));
            job.slot.deliver(result);
            return;
        }
    };

    if !local.needs_sandbox {
        debug!("No sandboxed problem, answering from the local check");
        let result = final_result(&job, &local, None);
        job.slot.deliver(result);
        return;
    }

    let reservation = match backend.reserve().await {
        Ok(reservation) => reservation,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "No capacity for job");
            let result = final_result(&job, &local, Some(RawResult::crash(e.to_string())));
            job.slot.deliver(result);
            return;
        }
    };

    let deadline = job.task.limits().hard_time_limit() + overhead;
    let request = NewJobRequest {
        job_id: job.id,
        course_id: job.task.course_id().to_string(),
        task_id: job.task.task_id().to_string(),
        input: job.input.clone(),
        debug: job.debug,
    };
    debug!(agent = reservation.agent, ?deadline, "Job dispatched");

    let backend = Arc::clone(backend);
    tokio::spawn(async move {
        let run = async move { backend.execute(&reservation, request).await };
        let outcome = tokio::time::timeout(deadline, AssertUnwindSafe(run).catch_unwind()).await;

        let raw = match outcome {
            Ok(Ok(Ok(raw))) => raw,
            Ok(Ok(Err(e))) => {
                warn!(job_id = %job.id, error = %format!("{:#}", e), "Backend failed to run job");
                RawResult::crash(e.to_string())
            }
            Ok(Err(_)) => {
                error!(job_id = %job.id, "Backend panicked while running job");
                RawResult::crash(INTERNAL_CRASH_TEXT)
            }
            Err(_) => {
                warn!(job_id = %job.id, ?deadline, "Job exceeded its supervision deadline");
                RawResult::crash(AGENT_TIMEOUT_TEXT)
            }
        };

        let result = final_result(&job, &local, Some(raw));
        info!(job_id = %job.id, result = %result.kind(), "Job completed");
        job.slot.deliver(result);
    });
}
