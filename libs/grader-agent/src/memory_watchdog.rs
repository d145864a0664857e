/// Memory Watchdog - Out-of-Memory Enforcement
///
/// **Core Responsibility:**
/// React to out-of-memory notifications from the container engine, confirm
/// them, kill the offending container and remember which ones it killed.
///
/// **Design:**
/// - One notification stream per registered container
/// - A control channel feeds new streams to the loop while it is blocked in a
///   single multiplexed wait over the control channel and every stream
/// - Unregistering drops a oneshot sender, which ends that container's stream
/// - A notification is confirmed against peak memory usage (or the engine's
///   own OOM-killed flag) before anything is killed
///
/// **Critical Properties:**
/// - A container gone from the engine is "not violated"
/// - `did_run_out_of_memory` consumes the record
use crate::runtime::ContainerRuntime;
use futures_util::stream::{BoxStream, SelectAll, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct Watch {
    container_id: String,
    events: BoxStream<'static, ()>,
    stop: oneshot::Receiver<()>,
}

struct Registration {
    threshold: u64,
    _stop: oneshot::Sender<()>,
}

pub struct MemoryWatchdog {
    runtime: Arc<dyn ContainerRuntime>,
    control: mpsc::UnboundedSender<Watch>,
    registered: Mutex<HashMap<String, Registration>>,
    killed: Mutex<HashSet<String>>,
}

impl MemoryWatchdog {
    /// Create the watchdog and start its loop on the current runtime
    pub fn spawn(runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        let (control, commands) = mpsc::unbounded_channel();
        let watchdog = Arc::new(Self {
            runtime,
            control,
            registered: Mutex::new(HashMap::new()),
            killed: Mutex::new(HashSet::new()),
        });
        tokio::spawn(Arc::clone(&watchdog).run(commands));
        watchdog
    }

    /// Watch `container_id`; `threshold` is the memory limit in bytes
    pub fn register(&self, container_id: &str, threshold: u64) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let events = self.runtime.oom_events(container_id);
        self.registered.lock().insert(
            container_id.to_string(),
            Registration {
                threshold,
                _stop: stop_tx,
            },
        );

        let watch = Watch {
            container_id: container_id.to_string(),
            events,
            stop: stop_rx,
        };
        if self.control.send(watch).is_err() {
            warn!(container_id, "Memory watchdog loop is gone, container not watched");
        }
        debug!(container_id, threshold, "Memory watch registered");
    }

    /// Stop watching and forget any unconsumed kill
    pub fn unregister(&self, container_id: &str) {
        let mut registered = self.registered.lock();
        registered.remove(container_id);
        self.killed.lock().remove(container_id);
    }

    /// Whether this watchdog killed the container. Consumes the record.
    pub fn did_run_out_of_memory(&self, container_id: &str) -> bool {
        self.killed.lock().remove(container_id)
    }

    /// Account for an OOM kill the engine performed before its notification
    /// reached the loop. Called once the container has exited.
    pub async fn flush(&self, container_id: &str) {
        if !self.registered.lock().contains_key(container_id) {
            return;
        }
        if self.runtime.oom_killed(container_id).await {
            // Lock order registered -> killed, so an unregister in between wins
            let registered = self.registered.lock();
            if registered.contains_key(container_id) {
                self.killed.lock().insert(container_id.to_string());
            }
        }
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<Watch>) {
        let mut sources: SelectAll<BoxStream<'static, String>> = SelectAll::new();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Watch { container_id, events, stop }) => {
                        sources.push(
                            events
                                .take_until(stop)
                                .map(move |_| container_id.clone())
                                .boxed(),
                        );
                    }
                    None => break,
                },
                Some(container_id) = sources.next(), if !sources.is_empty() => {
                    self.handle_event(&container_id).await;
                }
            }
        }
    }

    async fn handle_event(&self, container_id: &str) {
        let threshold = match self.registered.lock().get(container_id) {
            Some(registration) => registration.threshold,
            None => return,
        };

        let over_threshold = self
            .runtime
            .peak_memory(container_id)
            .await
            .is_some_and(|peak| peak >= threshold);
        if !over_threshold && !self.runtime.oom_killed(container_id).await {
            debug!(container_id, "Spurious OOM notification ignored");
            return;
        }

        {
            let mut registered = self.registered.lock();
            if registered.remove(container_id).is_none() {
                return;
            }
            self.killed.lock().insert(container_id.to_string());
        }

        warn!(container_id, threshold, "Killing container: memory limit reached");
        if let Err(e) = self.runtime.kill(container_id, "SIGKILL").await {
            warn!(container_id, error = %e, "Failed to kill container");
        }
    }
}
