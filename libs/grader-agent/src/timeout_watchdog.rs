/// Timeout Watchdog - CPU-Time and Wall-Clock Enforcement
///
/// **Core Responsibility:**
/// Kill containers that exceed their CPU-time limit, or that are still alive
/// when their hard (wall-clock) limit expires, and remember which ones it
/// killed.
///
/// **Algorithm:**
/// - Registration queues two entries in a min-heap keyed by wake time:
///   `(now + time, soft limit)` and `(now + hard_time, 0)`
/// - The loop pops the earliest entry. Not yet due: push it back and sleep
///   `min(remaining, 5s)` (or until a new registration arrives)
/// - Due with limit 0: hard timeout, kill
/// - Due otherwise: read CPU time. Under the limit: re-queue after
///   `ceil((limit - used) / cpu_count)` seconds. At or over: kill
/// - Unregistered containers are dropped lazily when their entries pop
///
/// **Critical Properties:**
/// - A container gone from the engine is "not violated", never an error
/// - `did_time_out` consumes the record: true at most once per kill
use crate::runtime::ContainerRuntime;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound on one sleep of the loop
const MAX_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    wake_at: Instant,
    seq: u64,
    container_id: String,
    /// CPU-time limit; zero marks the hard-timeout entry
    limit: Duration,
}

#[derive(Default)]
struct TimeoutState {
    queue: BinaryHeap<Reverse<Entry>>,
    watched: HashSet<String>,
    timed_out: HashSet<String>,
    seq: u64,
}

impl TimeoutState {
    fn push(&mut self, wake_at: Instant, container_id: &str, limit: Duration) {
        self.seq += 1;
        self.queue.push(Reverse(Entry {
            wake_at,
            seq: self.seq,
            container_id: container_id.to_string(),
            limit,
        }));
    }
}

enum Next {
    Idle,
    Sleep(Duration),
    Check(Entry),
}

pub struct TimeoutWatchdog {
    runtime: Arc<dyn ContainerRuntime>,
    state: Mutex<TimeoutState>,
    wake: Notify,
    cpu_count: u32,
}

impl TimeoutWatchdog {
    /// Create the watchdog and start its loop on the current runtime
    pub fn spawn(runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let watchdog = Arc::new(Self {
            runtime,
            state: Mutex::new(TimeoutState::default()),
            wake: Notify::new(),
            cpu_count,
        });
        tokio::spawn(Arc::clone(&watchdog).run());
        watchdog
    }

    pub fn register(&self, container_id: &str, cpu_limit: Duration, hard_limit: Duration) {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.watched.insert(container_id.to_string());
            state.push(now + cpu_limit, container_id, cpu_limit.max(Duration::from_secs(1)));
            state.push(now + hard_limit, container_id, Duration::ZERO);
        }
        debug!(container_id, ?cpu_limit, ?hard_limit, "Timeout watch registered");
        self.wake.notify_one();
    }

    /// Stop watching and forget any unconsumed kill; pending entries are
    /// discarded when they pop
    pub fn unregister(&self, container_id: &str) {
        let mut state = self.state.lock();
        state.watched.remove(container_id);
        state.timed_out.remove(container_id);
    }

    /// Whether this watchdog killed the container. Consumes the record.
    pub fn did_time_out(&self, container_id: &str) -> bool {
        self.state.lock().timed_out.remove(container_id)
    }

    fn next(&self) -> Next {
        let mut state = self.state.lock();
        loop {
            let Some(Reverse(entry)) = state.queue.pop() else {
                return Next::Idle;
            };
            if !state.watched.contains(&entry.container_id) {
                continue;
            }
            let now = Instant::now();
            if entry.wake_at > now {
                let remaining = entry.wake_at - now;
                state.queue.push(Reverse(entry));
                return Next::Sleep(remaining.min(MAX_SLEEP));
            }
            return Next::Check(entry);
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.next() {
                Next::Idle => self.wake.notified().await,
                Next::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Next::Check(entry) => self.check(entry).await,
            }
        }
    }

    async fn check(&self, entry: Entry) {
        let Some(used) = self.runtime.cpu_time(&entry.container_id).await else {
            // Already gone: nothing to enforce
            self.state.lock().watched.remove(&entry.container_id);
            return;
        };

        if entry.limit.is_zero() {
            self.kill(&entry.container_id, "hard time limit reached").await;
            return;
        }
        if used >= entry.limit {
            self.kill(&entry.container_id, "CPU time limit reached").await;
            return;
        }

        let delay = self.recheck_delay(entry.limit - used);
        let mut state = self.state.lock();
        if state.watched.contains(&entry.container_id) {
            state.push(Instant::now() + delay, &entry.container_id, entry.limit);
        }
    }

    /// `ceil(remaining / cpu_count)` whole seconds, at least one
    fn recheck_delay(&self, remaining: Duration) -> Duration {
        let seconds = (remaining.as_secs_f64() / self.cpu_count as f64).ceil().max(1.0);
        Duration::from_secs(seconds as u64)
    }

    async fn kill(&self, container_id: &str, reason: &str) {
        {
            let mut state = self.state.lock();
            if !state.watched.remove(container_id) {
                return;
            }
            state.timed_out.insert(container_id.to_string());
        }

        warn!(container_id, reason, "Killing container");
        if let Err(e) = self.runtime.kill(container_id, "SIGKILL").await {
            warn!(container_id, error = %e, "Failed to kill timed-out container");
        }
    }
}
