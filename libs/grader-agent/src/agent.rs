/// Agent - Container Lifecycle for One Grading Job
///
/// **Core Responsibility:**
/// Turn a `new_job` request into a `RawResult` by running the task's grading
/// program in a fresh container. The Agent never fails: every error, and
/// every panic, becomes a `crash` result.
///
/// **Lifecycle:**
/// 1. Load the task descriptor, resolve its environment through the aliases
/// 2. Prepare `tmp/<n>/{task,sockets}` with a writable `task/student`
/// 3. Open the sub-container control channel in `sockets/`
/// 4. Launch the container under both watchdogs, write the input to stdin
/// 5. Wait for exit, bounded by `hard_time`
/// 6. Consult the watchdogs (timeout, then memory), then the wait outcome,
///    then parse the result line from stdout
/// 7. Tear down: control channel, every container of the job, working dir
///
/// **Critical Properties:**
/// - Teardown runs on every path; a dropped or panicking job still spawns it
/// - Containers get the clamped memory limit plus a fixed headroom; the
///   memory watchdog is armed at the clamped limit itself
use crate::arena::{ContainerRole, WatchLimits};
use crate::control::{ControlContext, ControlServer};
use crate::runtime::{BindMount, ContainerRuntime, ContainerSpec, OutputChunk};
use crate::supervisor::{ContainerSupervisor, Violation};
use crate::workspace::JobWorkspace;
use anyhow::{Context, Result};
use futures_util::stream::{BoxStream, StreamExt};
use futures_util::FutureExt;
use grader_common::config::GraderConfig;
use grader_common::protocol::{parse_container_output, ContainerInput, NewJobRequest, RESULT_SENTINEL};
use grader_common::sync::{self, DirectoryHashes, SyncError};
use grader_common::task::{task_directory, GradingTask, TaskDescriptor};
use grader_common::types::{JobId, RawResult, ResultKind};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

pub const TASK_UNAVAILABLE_TEXT: &str = "Task unavailable on agent. Please retry later, the agents should synchronize soon. If the error persists, please contact your course administrator.";
pub const UNKNOWN_CONTAINER_TEXT: &str = "Unknown container. Please contact your course administrator.";
pub const CANNOT_START_TEXT: &str = "Cannot start container";
pub const RUN_FAILED_TEXT: &str = "An unknown error occurred while running the container";
pub const UNREADABLE_OUTPUT_TEXT: &str = "The grader did not return a readable output";

/// Per stream copy kept for debug output; anything beyond is dropped. The
/// result line is tracked apart from this copy.
pub const MAX_OUTPUT_BYTES: usize = 4 << 20;

/// How long output may trail behind the container's exit
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

pub struct Agent {
    supervisor: Arc<ContainerSupervisor>,
    aliases: Arc<RwLock<BTreeMap<String, String>>>,
    tasks_directory: PathBuf,
    tmp_dir: PathBuf,
    memory_ceiling_mb: u64,
    memory_headroom_mb: u64,
    max_subcontainers: usize,
    sync_enabled: bool,
    slots: Semaphore,
    concurrency: usize,
    next_workspace: AtomicU64,
    sync_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct CollectedOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Last stdout line carrying the result sentinel
    result_line: Option<String>,
}

fn append_capped(buffer: &mut Vec<u8>, bytes: &[u8]) {
    let room = MAX_OUTPUT_BYTES.saturating_sub(buffer.len());
    buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

/// Follows stdout line by line across chunk boundaries and remembers the
/// last result line, however much output came before it
#[derive(Default)]
struct ResultLineScanner {
    line: Vec<u8>,
    /// The current line outgrew `MAX_OUTPUT_BYTES` and is skipped
    overlong: bool,
    last: Option<Vec<u8>>,
}

impl ResultLineScanner {
    fn feed(&mut self, mut bytes: &[u8]) {
        while let Some(end) = bytes.iter().position(|&b| b == b'\n') {
            self.extend(&bytes[..end]);
            self.end_line();
            bytes = &bytes[end + 1..];
        }
        self.extend(bytes);
    }

    fn extend(&mut self, bytes: &[u8]) {
        if self.overlong {
            return;
        }
        if self.line.len() + bytes.len() > MAX_OUTPUT_BYTES {
            self.overlong = true;
            self.line.clear();
            return;
        }
        self.line.extend_from_slice(bytes);
    }

    fn end_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        if !std::mem::take(&mut self.overlong) && is_result_line(&line) {
            self.last = Some(line);
        }
    }

    /// Includes a trailing line without a final newline
    fn finish(mut self) -> Option<String> {
        self.end_line();
        self.last.map(|line| String::from_utf8_lossy(&line).into_owned())
    }
}

fn is_result_line(line: &[u8]) -> bool {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    line[start..].starts_with(RESULT_SENTINEL.as_bytes())
}

async fn collect_output(mut output: BoxStream<'static, Result<OutputChunk>>) -> CollectedOutput {
    let mut collected = CollectedOutput::default();
    let mut scanner = ResultLineScanner::default();
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(OutputChunk::Stdout(bytes)) => {
                scanner.feed(&bytes);
                append_capped(&mut collected.stdout, &bytes);
            }
            Ok(OutputChunk::Stderr(bytes)) => append_capped(&mut collected.stderr, &bytes),
            Err(e) => {
                debug!(error = %e, "Container output stream ended");
                break;
            }
        }
    }
    collected.result_line = scanner.finish();
    collected
}

/// How the primary container stopped
enum Exit {
    Code(i64),
    WaitFailed,
    HardTimeout,
}

impl Agent {
    /// Must be called inside a tokio runtime (the watchdog loops are spawned)
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &GraderConfig) -> Arc<Self> {
        Arc::new(Self {
            supervisor: ContainerSupervisor::spawn(runtime),
            aliases: Arc::new(RwLock::new(config.image_aliases.clone())),
            tasks_directory: config.tasks_directory.clone(),
            tmp_dir: config.agent.tmp_dir.clone(),
            memory_ceiling_mb: config.agent.memory_ceiling_mb,
            memory_headroom_mb: config.agent.memory_headroom_mb,
            max_subcontainers: config.agent.max_subcontainers,
            sync_enabled: config.agent.sync_enabled,
            slots: Semaphore::new(config.agent.concurrency.max(1)),
            concurrency: config.agent.concurrency.max(1),
            next_workspace: AtomicU64::new(1),
            sync_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    pub fn supervisor(&self) -> &Arc<ContainerSupervisor> {
        &self.supervisor
    }

    /// Replace the environment → image table
    pub fn update_aliases(&self, aliases: BTreeMap<String, String>) {
        info!(count = aliases.len(), "Image aliases updated");
        *self.aliases.write() = aliases;
    }

    pub fn resolve_image(&self, environment: &str) -> Option<String> {
        self.aliases.read().get(environment).cloned()
    }

    /// Run one job to completion. Never fails.
    #[instrument(skip(self, request), fields(job_id = %request.job_id, course = %request.course_id, task = %request.task_id))]
    pub async fn run_job(&self, request: NewJobRequest) -> RawResult {
        let _slot = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return RawResult::crash(RUN_FAILED_TEXT),
        };

        match AssertUnwindSafe(self.execute(&request)).catch_unwind().await {
            Ok(Ok(result)) => {
                info!(result = %result.kind, "Job finished");
                result
            }
            Ok(Err(e)) => {
                error!(error = %format!("{:#}", e), "Job crashed");
                RawResult::crash(format!("{}: {:#}", RUN_FAILED_TEXT, e))
            }
            Err(_) => {
                error!("Job panicked");
                RawResult::crash(RUN_FAILED_TEXT)
            }
        }
    }

    async fn execute(&self, request: &NewJobRequest) -> Result<RawResult> {
        let task = match TaskDescriptor::load(&self.tasks_directory, &request.course_id, &request.task_id) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Task not available");
                return Ok(RawResult::crash(TASK_UNAVAILABLE_TEXT));
            }
        };
        let Some(image) = self.resolve_image(task.environment()) else {
            warn!(environment = %task.environment(), "No image for environment");
            return Ok(RawResult::crash(UNKNOWN_CONTAINER_TEXT));
        };
        if let Err(e) = self.supervisor.runtime.ensure_image(&image).await {
            warn!(image = %image, error = %format!("{:#}", e), "Image unavailable");
            return Ok(RawResult::crash(CANNOT_START_TEXT));
        }

        let source = task_directory(&self.tasks_directory, &request.course_id, &request.task_id)?;
        let internal_id = self.next_workspace.fetch_add(1, Ordering::SeqCst);
        let workspace = JobWorkspace::prepare(&self.tmp_dir, internal_id, &source)
            .context("Failed to prepare the job directory")?;
        let mut teardown = JobTeardown::new(Arc::clone(&self.supervisor), request.job_id, workspace.root.clone());

        let result = self.supervise(request, &task, image, &workspace, &mut teardown).await;
        teardown.run().await;
        result
    }

    async fn supervise(
        &self,
        request: &NewJobRequest,
        task: &TaskDescriptor,
        image: String,
        workspace: &JobWorkspace,
        teardown: &mut JobTeardown,
    ) -> Result<RawResult> {
        let limits = task.limits();
        let memory_mb = limits.clamped_memory_mb(self.memory_ceiling_mb);

        teardown.control = Some(ControlServer::start(ControlContext {
            job_id: request.job_id,
            supervisor: Arc::clone(&self.supervisor),
            aliases: Arc::clone(&self.aliases),
            default_environment: task.environment().to_string(),
            default_limits: limits,
            memory_ceiling_mb: self.memory_ceiling_mb,
            max_subcontainers: self.max_subcontainers,
            sockets_dir: workspace.sockets.clone(),
            student_dir: workspace.student.clone(),
        })?);

        let spec = ContainerSpec {
            name: format!("grader-{}", request.job_id.simple()),
            image,
            command: task.command.clone(),
            workdir: Some("/task".to_string()),
            memory_bytes: (memory_mb + self.memory_headroom_mb) << 20,
            binds: vec![
                BindMount::rw(workspace.task.display().to_string(), "/task"),
                BindMount::rw(workspace.sockets.display().to_string(), "/sockets"),
            ],
        };
        let watch = WatchLimits {
            cpu_time: limits.time_limit(),
            hard_time: limits.hard_time_limit(),
            memory_bytes: memory_mb << 20,
        };

        let (container_id, mut io) = match self
            .supervisor
            .launch(request.job_id, ContainerRole::Primary, &spec, watch)
            .await
        {
            Ok(launched) => launched,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Container did not start");
                return Ok(RawResult::crash(CANNOT_START_TEXT));
            }
        };
        let collector = tokio::spawn(collect_output(io.output));

        let input = ContainerInput {
            input: request.input.clone(),
            limits: grader_common::types::Limits {
                memory: memory_mb,
                hard_time: Some(limits.effective_hard_time()),
                ..limits
            },
            debug: request.debug,
        };
        let mut payload = serde_json::to_vec(&input)?;
        payload.push(b'\n');
        if let Err(e) = io.input.write_all(&payload).await {
            warn!(container_id = %container_id, error = %e, "Failed to write container input");
        }
        let _ = io.input.shutdown().await;
        drop(io.input);

        let exit = match tokio::time::timeout(watch.hard_time, self.supervisor.runtime.wait(&container_id)).await {
            Ok(Ok(code)) => Exit::Code(code),
            Ok(Err(e)) => {
                warn!(container_id = %container_id, error = %format!("{:#}", e), "Waiting for container failed");
                Exit::WaitFailed
            }
            Err(_) => {
                warn!(container_id = %container_id, "Container still running at hard time limit");
                if let Err(e) = self.supervisor.runtime.kill(&container_id, "SIGKILL").await {
                    warn!(container_id = %container_id, error = %e, "Failed to kill container");
                }
                Exit::HardTimeout
            }
        };

        let output = match tokio::time::timeout(OUTPUT_GRACE, collector).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "Output collector failed");
                CollectedOutput::default()
            }
            Err(_) => {
                warn!(container_id = %container_id, "Output did not close after exit");
                CollectedOutput::default()
            }
        };
        let violation = self.supervisor.violation(&container_id).await;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let mut result = match (violation, exit) {
            (Some(Violation::Timeout), _) | (_, Exit::HardTimeout) => RawResult::new(ResultKind::Timeout),
            (Some(Violation::Memory), _) => RawResult::new(ResultKind::Overflow),
            (None, Exit::WaitFailed) => RawResult::crash(RUN_FAILED_TEXT),
            (None, Exit::Code(code)) => match parse_container_output(output.result_line.as_deref().unwrap_or_default()) {
                Ok(result) => result,
                Err(e) => {
                    warn!(exit_code = code, error = %e, "No result in container output");
                    RawResult::crash(UNREADABLE_OUTPUT_TEXT)
                }
            },
        };
        debug!(container_id = %container_id, result = %result.kind, "Container finished");

        if request.debug {
            result.stdout = Some(stdout);
            result.stderr = Some(stderr);
        }
        Ok(result)
    }

    /// `None` when this agent does not accept synchronisation
    pub async fn directory_hashes(&self) -> Result<Option<DirectoryHashes>> {
        if !self.sync_enabled {
            return Ok(None);
        }
        let _guard = self.sync_lock.lock().await;
        let root = self.tasks_directory.clone();
        let hashes = tokio::task::spawn_blocking(move || sync::directory_hashes(&root)).await??;
        Ok(Some(hashes))
    }

    /// Apply a delta pushed by the backend; the whole batch is rejected on
    /// any invalid path
    pub async fn update_directory(&self, archive: Vec<u8>, delete: Vec<String>) -> Result<(), SyncError> {
        let _guard = self.sync_lock.lock().await;
        let root = self.tasks_directory.clone();
        let files = delete.len();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            sync::apply_update(&root, &archive, &delete)
        })
        .await
        .map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        info!(deleted = files, "Task directory updated");
        Ok(())
    }
}

/// Releases everything a job acquired. `run` does it in line; dropping an
/// unfinished guard spawns the same work.
struct JobTeardown {
    supervisor: Arc<ContainerSupervisor>,
    job_id: JobId,
    root: PathBuf,
    control: Option<ControlServer>,
    done: bool,
}

impl JobTeardown {
    fn new(supervisor: Arc<ContainerSupervisor>, job_id: JobId, root: PathBuf) -> Self {
        Self {
            supervisor,
            job_id,
            root,
            control: None,
            done: false,
        }
    }

    async fn run(mut self) {
        self.done = true;
        teardown(Arc::clone(&self.supervisor), self.job_id, self.root.clone(), self.control.take()).await;
    }
}

impl Drop for JobTeardown {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let work = teardown(Arc::clone(&self.supervisor), self.job_id, self.root.clone(), self.control.take());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(work);
            }
            Err(_) => warn!(job_id = %self.job_id, "No runtime to tear down job"),
        }
    }
}

async fn teardown(supervisor: Arc<ContainerSupervisor>, job_id: JobId, root: PathBuf, control: Option<ControlServer>) {
    if let Some(control) = control {
        control.shutdown();
    }
    supervisor.release_job(job_id).await;
    match tokio::fs::remove_dir_all(&root).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id = %job_id, path = %root.display(), error = %e, "Failed to remove job directory"),
    }
    debug!(job_id = %job_id, "Job torn down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeBehavior, FakeRuntime};
    use grader_common::merge::merge;
    use grader_common::protocol::format_result_line;
    use grader_common::sync::{compare, pack_archive};
    use grader_common::types::LocalCheck;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        dir: TempDir,
        fake: FakeRuntime,
        agent: Arc<Agent>,
    }

    impl Fixture {
        fn tasks(&self) -> PathBuf {
            self.dir.path().join("tasks")
        }

        fn tmp(&self) -> PathBuf {
            self.dir.path().join("tmp")
        }

        fn leftover_job_dirs(&self) -> usize {
            fs::read_dir(self.tmp()).map(|entries| entries.count()).unwrap_or(0)
        }
    }

    fn write_task(tasks: &std::path::Path, task_id: &str, task: serde_json::Value) {
        let dir = tasks.join("course").join(task_id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("task.json"), task.to_string()).unwrap();
        fs::write(dir.join("run.sh"), "#!/bin/sh\n").unwrap();
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let tasks = dir.path().join("tasks");
        write_task(&tasks, "fast", json!({"environment": "python", "limits": {"time": 5, "memory": 64}}));
        write_task(&tasks, "slow", json!({"environment": "python", "limits": {"time": 1, "hard_time": 2, "memory": 64}}));
        write_task(&tasks, "cobol", json!({"environment": "cobol"}));

        let mut config = GraderConfig::default();
        config.tasks_directory = tasks;
        config.agent.tmp_dir = dir.path().join("tmp");
        config.image_aliases = BTreeMap::from([("python".to_string(), "grader/python".to_string())]);

        let fake = FakeRuntime::new();
        let agent = Agent::new(Arc::new(fake.clone()), &config);
        Fixture { dir, fake, agent }
    }

    fn request(task_id: &str) -> NewJobRequest {
        NewJobRequest {
            job_id: Uuid::new_v4(),
            course_id: "course".to_string(),
            task_id: task_id.to_string(),
            input: BTreeMap::from([("q1".to_string(), json!("print(42)"))]),
            debug: false,
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let f = fixture();
        let reported = RawResult::with_text(ResultKind::Success, "All tests passed");
        f.fake.script("grader/python", FakeBehavior::reporting(&reported));

        let result = f.agent.run_job(request("fast")).await;
        assert_eq!(result, reported);

        let (container_id, spec) = &f.fake.created()[0];
        assert_eq!(spec.memory_bytes, (64 + 10) << 20);
        assert_eq!(spec.binds.len(), 2);

        let stdin: serde_json::Value = serde_json::from_slice(&f.fake.stdin(container_id)).unwrap();
        assert_eq!(stdin["input"]["q1"], json!("print(42)"));
        assert_eq!(stdin["limits"]["hard_time"], json!(15));
        assert!(stdin.get("debug").is_none());

        assert_eq!(f.fake.live(), 0);
        assert_eq!(f.leftover_job_dirs(), 0);
        assert!(f.agent.supervisor().arena.is_empty());
    }

    #[tokio::test]
    async fn test_debug_attaches_output() {
        let f = fixture();
        let mut behavior = FakeBehavior::reporting(&RawResult::new(ResultKind::Failed));
        behavior.stderr = "Traceback".to_string();
        f.fake.script("grader/python", behavior);

        let mut req = request("fast");
        req.debug = true;
        let result = f.agent.run_job(req).await;
        assert_eq!(result.kind, ResultKind::Failed);
        assert!(result.stdout.unwrap().contains("starting"));
        assert_eq!(result.stderr.as_deref(), Some("Traceback"));
    }

    #[tokio::test]
    async fn test_setup_failures_crash_with_explanation() {
        let f = fixture();

        let missing = f.agent.run_job(request("absent")).await;
        assert_eq!(missing, RawResult::crash(TASK_UNAVAILABLE_TEXT));

        let unknown = f.agent.run_job(request("cobol")).await;
        assert_eq!(unknown, RawResult::crash(UNKNOWN_CONTAINER_TEXT));

        f.fake.missing_image("grader/python");
        let unpulled = f.agent.run_job(request("fast")).await;
        assert_eq!(unpulled, RawResult::crash(CANNOT_START_TEXT));

        assert!(f.fake.created().is_empty());
        assert_eq!(f.leftover_job_dirs(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_crashes() {
        let f = fixture();
        f.fake.script(
            "grader/python",
            FakeBehavior {
                fail_create: true,
                ..FakeBehavior::default()
            },
        );
        let result = f.agent.run_job(request("fast")).await;
        assert_eq!(result, RawResult::crash(CANNOT_START_TEXT));
        assert_eq!(f.leftover_job_dirs(), 0);
    }

    #[tokio::test]
    async fn test_result_line_after_large_output() {
        let f = fixture();
        let reported = RawResult::with_text(ResultKind::Success, "ok");
        let mut behavior = FakeBehavior::reporting(&reported);
        behavior.stdout = format!("{}{}", "debug line\n".repeat(500_000), behavior.stdout);
        f.fake.script("grader/python", behavior);

        let mut req = request("fast");
        req.debug = true;
        let result = f.agent.run_job(req).await;
        assert_eq!(result.kind, ResultKind::Success);
        assert_eq!(result.text.as_deref(), Some("ok"));
        assert_eq!(result.stdout.map(|stdout| stdout.len()), Some(MAX_OUTPUT_BYTES));
    }

    #[test]
    fn test_result_line_split_across_chunks() {
        let line = format_result_line(&RawResult::new(ResultKind::Failed)).unwrap();
        let (head, tail) = line.split_at(5);

        let mut scanner = ResultLineScanner::default();
        scanner.feed(b"noise\n  ");
        scanner.feed(head.as_bytes());
        scanner.feed(format!("{}\nmore noise\n", tail).as_bytes());
        scanner.feed(b"trailing");
        assert_eq!(scanner.finish().as_deref(), Some(format!("  {}", line).as_str()));

        let mut scanner = ResultLineScanner::default();
        scanner.feed(&vec![b'x'; MAX_OUTPUT_BYTES + 1]);
        scanner.feed(format!("{}\n", line).as_bytes());
        assert_eq!(scanner.finish(), None);
    }

    #[tokio::test]
    async fn test_missing_result_line_crashes() {
        let f = fixture();
        f.fake.script(
            "grader/python",
            FakeBehavior {
                stdout: "Segmentation fault\n".to_string(),
                exit_code: 139,
                ..FakeBehavior::default()
            },
        );
        let result = f.agent.run_job(request("fast")).await;
        assert_eq!(result, RawResult::crash(UNREADABLE_OUTPUT_TEXT));
    }

    #[tokio::test]
    async fn test_wait_failure_crashes() {
        let f = fixture();
        f.fake.script(
            "grader/python",
            FakeBehavior {
                fail_wait: true,
                ..FakeBehavior::reporting(&RawResult::new(ResultKind::Success))
            },
        );
        let result = f.agent.run_job(request("fast")).await;
        assert_eq!(result, RawResult::crash(RUN_FAILED_TEXT));
        assert_eq!(f.fake.live(), 0);
    }

    #[tokio::test]
    async fn test_cpu_time_limit() {
        let f = fixture();
        f.fake.script("grader/python", FakeBehavior::hanging(Duration::from_secs(10)));

        let result = f.agent.run_job(request("slow")).await;
        assert_eq!(result.kind, ResultKind::Timeout);
        let verdict = merge(&LocalCheck { ok: true, needs_sandbox: true, ..LocalCheck::default() }, Some(result));
        assert_eq!(verdict.kind, ResultKind::Timeout);
        assert_eq!(f.fake.live(), 0);
    }

    #[tokio::test]
    async fn test_hard_time_limit() {
        let f = fixture();
        f.fake.script("grader/python", FakeBehavior::hanging(Duration::ZERO));

        let result = f.agent.run_job(request("slow")).await;
        assert_eq!(result.kind, ResultKind::Timeout);
        let (container_id, _) = &f.fake.created()[0];
        assert!(f.fake.was_killed(container_id));
        assert_eq!(f.leftover_job_dirs(), 0);
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let f = fixture();
        f.fake.script(
            "grader/python",
            FakeBehavior {
                oom_after: Some(Duration::from_millis(20)),
                ..FakeBehavior::hanging(Duration::ZERO)
            },
        );
        let result = f.agent.run_job(request("fast")).await;
        assert_eq!(result.kind, ResultKind::Overflow);
        assert_eq!(f.fake.live(), 0);
    }

    #[tokio::test]
    async fn test_aliases_can_be_replaced() {
        let f = fixture();
        assert_eq!(f.agent.resolve_image("python").as_deref(), Some("grader/python"));
        f.agent.update_aliases(BTreeMap::from([("cobol".to_string(), "grader/cobol".to_string())]));
        assert_eq!(f.agent.resolve_image("python"), None);

        f.fake.script("grader/cobol", FakeBehavior::reporting(&RawResult::new(ResultKind::Success)));
        assert_eq!(f.agent.run_job(request("cobol")).await.kind, ResultKind::Success);
    }

    #[tokio::test]
    async fn test_directory_update_round() {
        let f = fixture();
        let master = TempDir::new().unwrap();
        fs::create_dir_all(master.path().join("course/fast")).unwrap();
        fs::write(master.path().join("course/fast/task.json"), "{}").unwrap();

        let remote = f.agent.directory_hashes().await.unwrap().unwrap();
        let master_hashes = sync::directory_hashes(master.path()).unwrap();
        let delta = compare(&master_hashes, &remote);
        assert_eq!(delta.to_send, vec!["course/fast/task.json".to_string()]);
        assert!(delta.to_delete.contains(&"course/slow/task.json".to_string()));

        let archive = pack_archive(master.path(), &delta.to_send).unwrap();
        f.agent.update_directory(archive, delta.to_delete).await.unwrap();

        let remote = f.agent.directory_hashes().await.unwrap().unwrap();
        assert!(compare(&master_hashes, &remote).is_empty());
        assert!(f.agent.update_directory(Vec::new(), vec!["../escape".to_string()]).await.is_err());
    }
}
