// Scripted in-memory ContainerRuntime used by tests in this workspace.
// Behaviour is keyed by image name; containers "run" on tokio timers.
use crate::runtime::{AttachedIo, ContainerRuntime, ContainerSpec, OutputChunk};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use grader_common::protocol::format_result_line;
use grader_common::types::RawResult;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// `None` keeps the container running until it is killed
    pub run_for: Option<Duration>,
    pub cpu_time: Duration,
    pub peak_memory: u64,
    /// Emit an OOM notification (and flag the container OOM-killed) after this delay
    pub oom_after: Option<Duration>,
    pub fail_create: bool,
    pub fail_wait: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            run_for: Some(Duration::from_millis(10)),
            cpu_time: Duration::ZERO,
            peak_memory: 0,
            oom_after: None,
            fail_create: false,
            fail_wait: false,
        }
    }
}

impl FakeBehavior {
    /// A grading program that prints `result` and exits
    pub fn reporting(result: &RawResult) -> Self {
        Self {
            stdout: format!("starting\n{}\n", format_result_line(result).unwrap_or_default()),
            ..Self::default()
        }
    }

    /// A program that never exits on its own and burns `cpu_time`
    pub fn hanging(cpu_time: Duration) -> Self {
        Self {
            run_for: None,
            cpu_time,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Exited { code: i64, killed: bool },
}

struct FakeContainer {
    behavior: FakeBehavior,
    status: watch::Sender<State>,
    cpu_time: Option<Duration>,
    peak_memory: Option<u64>,
    oom_listeners: Vec<mpsc::UnboundedSender<()>>,
}

#[derive(Default)]
struct FakeState {
    scripts: HashMap<String, FakeBehavior>,
    missing_images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    created: Vec<(String, ContainerSpec)>,
    removed: Vec<String>,
    signals: HashMap<String, Vec<String>>,
    stdin: HashMap<String, Arc<Mutex<Vec<u8>>>>,
    oom_killed: HashSet<String>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

struct FakeStdin {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for FakeStdin {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.buffer.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn signal_exit_code(signal: &str) -> i64 {
    match signal.trim_start_matches("SIG") {
        "TERM" | "15" => 143,
        "INT" | "2" => 130,
        _ => 137,
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, image: &str, behavior: FakeBehavior) {
        self.state.lock().scripts.insert(image.to_string(), behavior);
    }

    pub fn missing_image(&self, image: &str) {
        self.state.lock().missing_images.insert(image.to_string());
    }

    pub fn created(&self) -> Vec<(String, ContainerSpec)> {
        self.state.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    /// Containers created and not yet removed
    pub fn live(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn signals(&self, container_id: &str) -> Vec<String> {
        self.state
            .lock()
            .signals
            .get(container_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn was_killed(&self, container_id: &str) -> bool {
        !self.signals(container_id).is_empty()
    }

    pub fn stdin(&self, container_id: &str) -> Vec<u8> {
        self.state
            .lock()
            .stdin
            .get(container_id)
            .map(|buffer| buffer.lock().clone())
            .unwrap_or_default()
    }

    pub fn set_cpu_time(&self, container_id: &str, cpu_time: Duration) {
        if let Some(container) = self.state.lock().containers.get_mut(container_id) {
            container.cpu_time = Some(cpu_time);
        }
    }

    pub fn set_peak_memory(&self, container_id: &str, bytes: u64) {
        if let Some(container) = self.state.lock().containers.get_mut(container_id) {
            container.peak_memory = Some(bytes);
        }
    }

    /// Deliver an OOM notification without the engine confirming a kill
    pub fn notify_oom(&self, container_id: &str) {
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.oom_listeners.retain(|tx| tx.send(()).is_ok());
        }
    }

    fn exit(&self, container_id: &str, code: i64, killed: bool) {
        let state = self.state.lock();
        if let Some(container) = state.containers.get(container_id) {
            container.status.send_if_modified(|status| match status {
                State::Created | State::Running => {
                    *status = State::Exited { code, killed };
                    true
                }
                State::Exited { .. } => false,
            });
        }
    }

    fn mark_running(&self, container_id: &str) {
        let state = self.state.lock();
        if let Some(container) = state.containers.get(container_id) {
            container.status.send_if_modified(|status| {
                if *status == State::Created {
                    *status = State::Running;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn subscribe(&self, container_id: &str) -> Result<(watch::Receiver<State>, FakeBehavior)> {
        let state = self.state.lock();
        match state.containers.get(container_id) {
            Some(container) => Ok((container.status.subscribe(), container.behavior.clone())),
            None => bail!("No such container: {}", container_id),
        }
    }
}

/// Resolves with `Some((code, killed))` once exited, `None` if the container was removed
async fn exited(status: &mut watch::Receiver<State>) -> Option<(i64, bool)> {
    loop {
        let current = *status.borrow_and_update();
        if let State::Exited { code, killed } = current {
            return Some((code, killed));
        }
        if status.changed().await.is_err() {
            return None;
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.state.lock().missing_images.contains(image) {
            bail!("Failed to pull Docker image '{}'", image);
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock();
        let behavior = state.scripts.get(&spec.image).cloned().unwrap_or_default();
        if behavior.fail_create {
            bail!("Failed to create container from '{}'", spec.image);
        }

        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let (status, _) = watch::channel(State::Created);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                behavior,
                status,
                cpu_time: None,
                peak_memory: None,
                oom_listeners: Vec::new(),
            },
        );
        state.stdin.insert(id.clone(), Arc::new(Mutex::new(Vec::new())));
        state.created.push((id.clone(), spec.clone()));
        Ok(id)
    }

    async fn attach(&self, container_id: &str) -> Result<AttachedIo> {
        let (mut status, behavior) = self.subscribe(container_id)?;
        let buffer = self
            .state
            .lock()
            .stdin
            .get(container_id)
            .cloned()
            .unwrap_or_default();

        let output = stream::once(async move {
            let mut chunks: Vec<Result<OutputChunk>> = Vec::new();
            if let Some((_, false)) = exited(&mut status).await {
                if !behavior.stdout.is_empty() {
                    chunks.push(Ok(OutputChunk::Stdout(behavior.stdout.into_bytes())));
                }
                if !behavior.stderr.is_empty() {
                    chunks.push(Ok(OutputChunk::Stderr(behavior.stderr.into_bytes())));
                }
            }
            stream::iter(chunks)
        })
        .flatten()
        .boxed();

        Ok(AttachedIo {
            output,
            input: Box::pin(FakeStdin { buffer }),
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        let (_, behavior) = self.subscribe(container_id)?;
        self.mark_running(container_id);

        if let Some(after) = behavior.oom_after {
            let runtime = self.clone();
            let id = container_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                runtime.state.lock().oom_killed.insert(id.clone());
                runtime.notify_oom(&id);
            });
        }
        if let Some(run_for) = behavior.run_for {
            let runtime = self.clone();
            let id = container_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(run_for).await;
                runtime.exit(&id, behavior.exit_code, false);
            });
        }
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        let (mut status, behavior) = self.subscribe(container_id)?;
        match exited(&mut status).await {
            Some(_) if behavior.fail_wait => bail!("Failed to wait for container"),
            Some((code, _)) => Ok(code),
            None => bail!("Container {} removed while waiting", container_id),
        }
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<()> {
        self.state
            .lock()
            .signals
            .entry(container_id.to_string())
            .or_default()
            .push(signal.to_string());
        self.exit(container_id, signal_exit_code(signal), true);
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.containers.remove(container_id).is_some() {
            state.removed.push(container_id.to_string());
        }
        Ok(())
    }

    async fn cpu_time(&self, container_id: &str) -> Option<Duration> {
        let state = self.state.lock();
        let container = state.containers.get(container_id)?;
        Some(container.cpu_time.unwrap_or(container.behavior.cpu_time))
    }

    async fn peak_memory(&self, container_id: &str) -> Option<u64> {
        let state = self.state.lock();
        let container = state.containers.get(container_id)?;
        Some(container.peak_memory.unwrap_or(container.behavior.peak_memory))
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        self.state.lock().oom_killed.contains(container_id)
    }

    fn oom_events(&self, container_id: &str) -> BoxStream<'static, ()> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(container) = self.state.lock().containers.get_mut(container_id) {
            container.oom_listeners.push(tx);
        }
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
    }
}
