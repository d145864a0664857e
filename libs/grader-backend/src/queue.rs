// Pending jobs in submission order, each carrying a single-use result slot
use grader_common::merge::merge;
use grader_common::task::GradingTask;
use grader_common::types::{FinalResult, JobId, LocalCheck, RawResult, SubmissionInput};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tracing::warn;

pub const ABANDONED_TEXT: &str = "The grading backend was shut down before your submission ran";

pub type Callback = Box<dyn FnOnce(FinalResult) + Send + 'static>;

enum Delivery {
    Callback(Callback),
    Channel(oneshot::Sender<FinalResult>),
}

/// Where a job's final result goes. Only the first `deliver` has an effect.
pub struct ResultSlot {
    job_id: JobId,
    delivery: Mutex<Option<Delivery>>,
}

impl ResultSlot {
    pub fn callback(job_id: JobId, callback: Callback) -> Self {
        Self {
            job_id,
            delivery: Mutex::new(Some(Delivery::Callback(callback))),
        }
    }

    pub fn channel(job_id: JobId) -> (Self, oneshot::Receiver<FinalResult>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            job_id,
            delivery: Mutex::new(Some(Delivery::Channel(tx))),
        };
        (slot, rx)
    }

    /// Returns false when a result was already delivered
    pub fn deliver(&self, result: FinalResult) -> bool {
        let Some(delivery) = self.delivery.lock().take() else {
            warn!(job_id = %self.job_id, "Result already delivered, dropping duplicate");
            return false;
        };
        match delivery {
            Delivery::Callback(callback) => callback(result),
            Delivery::Channel(tx) => {
                // The receiver may have been dropped; the job still counts as delivered
                let _ = tx.send(result);
            }
        }
        true
    }

    pub fn is_delivered(&self) -> bool {
        self.delivery.lock().is_none()
    }
}

pub struct Job {
    pub id: JobId,
    pub task: Arc<dyn GradingTask>,
    pub input: SubmissionInput,
    pub debug: bool,
    pub slot: ResultSlot,
}

/// A job dropped without a result (dispatcher stopped, task aborted) still
/// gets one
impl Drop for Job {
    fn drop(&mut self) {
        if self.slot.is_delivered() {
            return;
        }
        warn!(job_id = %self.id, "Job dropped before completion");
        let verdict = merge(&LocalCheck::default(), Some(RawResult::crash(ABANDONED_TEXT)));
        self.slot.deliver(FinalResult::new(
            self.id,
            self.task.course_id(),
            self.task.task_id(),
            verdict,
        ));
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("course_id", &self.task.course_id())
            .field("task_id", &self.task.task_id())
            .field("debug", &self.debug)
            .finish()
    }
}

#[derive(Default)]
pub struct JobQueue {
    pending: Mutex<VecDeque<Job>>,
    available: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.pending.lock().push_back(job);
        self.available.notify_one();
    }

    /// Waits until a job is available
    pub async fn pop(&self) -> Job {
        loop {
            let notified = self.available.notified();
            if let Some(job) = self.pending.lock().pop_front() {
                return job;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remove every pending job
    pub fn drain(&self) -> Vec<Job> {
        self.pending.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grader_common::task::TaskDescriptor;
    use grader_common::types::{ResultKind, Verdict};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn task() -> Arc<dyn GradingTask> {
        let mut task: TaskDescriptor = serde_json::from_str("{}").unwrap();
        task.course_id = "c".to_string();
        task.task_id = "t".to_string();
        Arc::new(task)
    }

    fn job(id: JobId) -> Job {
        Job {
            id,
            task: task(),
            input: SubmissionInput::new(),
            debug: false,
            slot: ResultSlot::callback(id, Box::new(|_| {})),
        }
    }

    fn result(id: JobId) -> FinalResult {
        let verdict = Verdict {
            kind: ResultKind::Success,
            text: String::new(),
            problems: Default::default(),
            stdout: None,
            stderr: None,
            archive: None,
        };
        FinalResult::new(id, "c", "t", verdict)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new();
        let ids: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.push(job(*id));
        }
        assert_eq!(queue.len(), 3);
        for id in &ids {
            assert_eq!(queue.pop().await.id, *id);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(JobQueue::new());
        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.pop().await.id }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        let id = Uuid::new_v4();
        queue.push(job(id));
        assert_eq!(consumer.await.unwrap(), id);
    }

    #[test]
    fn test_slot_delivers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let id = Uuid::new_v4();
        let counter = Arc::clone(&calls);
        let slot = ResultSlot::callback(
            id,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(slot.deliver(result(id)));
        assert!(!slot.deliver(result(id)));
        assert!(slot.is_delivered());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_slot() {
        let id = Uuid::new_v4();
        let (slot, rx) = ResultSlot::channel(id);
        slot.deliver(result(id));
        assert_eq!(rx.await.unwrap().job_id, id);
    }

    #[tokio::test]
    async fn test_dropped_job_is_answered() {
        let id = Uuid::new_v4();
        let (slot, rx) = ResultSlot::channel(id);
        let queue = JobQueue::new();
        queue.push(Job {
            id,
            task: task(),
            input: SubmissionInput::new(),
            debug: false,
            slot,
        });
        drop(queue.drain());

        let result = rx.await.unwrap();
        assert_eq!(result.kind(), ResultKind::Crash);
        assert_eq!(result.text(), ABANDONED_TEXT);
    }
}
