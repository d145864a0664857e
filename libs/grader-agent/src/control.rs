/// Sub-Container Control Server
///
/// **Core Responsibility:**
/// Let code running inside a job container start nested containers (e.g. to
/// run a student's program in yet another environment) over a Unix socket in
/// the job's `/sockets` directory.
///
/// **Protocol:**
/// Newline-delimited JSON, one response per request, versioned
/// (`grader_common::protocol::ControlRequest`):
/// - `run`    → starts a sub-container, answers with a handle and the name of
///              a socket streaming `[stream][len][bytes]` output frames
/// - `stdin`  → answers with the name of a socket forwarded to the stdin
/// - `signal` → delivers a signal
/// - `close`  → waits for exit, removes the container, answers the exit code
///              (253 timeout, 252 memory, 254 wait failure)
///
/// **Critical Properties:**
/// - Empty/zero `run` parameters fall back to the parent task's settings
/// - Sub-containers are watched exactly like the job container
/// - At most `max_subcontainers` alive per job
use crate::arena::{ContainerRole, WatchLimits};
use crate::runtime::{BindMount, ContainerSpec, OutputChunk};
use crate::supervisor::{ContainerSupervisor, Violation};
use crate::workspace::STUDENT_DIR;
use anyhow::{Context, Result};
use futures_util::stream::{BoxStream, StreamExt};
use grader_common::protocol::{
    decode_request, encode_frame, encode_output_frame, ControlCommand, ControlResponse,
    CONTROL_SOCKET, STREAM_STDERR, STREAM_STDOUT,
};
use grader_common::types::{JobId, Limits};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EXIT_TIMEOUT: i64 = 253;
pub const EXIT_MEMORY: i64 = 252;
pub const EXIT_WAIT_FAILED: i64 = 254;

const DEFAULT_WORKDIR: &str = "/task/student";

/// What a job's control channel needs to know about its parent
pub struct ControlContext {
    pub job_id: JobId,
    pub supervisor: Arc<ContainerSupervisor>,
    pub aliases: Arc<RwLock<BTreeMap<String, String>>>,
    pub default_environment: String,
    pub default_limits: Limits,
    pub memory_ceiling_mb: u64,
    pub max_subcontainers: usize,
    pub sockets_dir: PathBuf,
    pub student_dir: PathBuf,
}

struct SubContainer {
    container_id: String,
    input: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    /// Held until the sub-container is closed or the job ends
    _slot: OwnedSemaphorePermit,
}

struct ControlState {
    context: ControlContext,
    /// One permit per sub-container the job may keep alive
    slots: Arc<Semaphore>,
    handles: Mutex<HashMap<String, SubContainer>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_handle: AtomicU64,
}

pub struct ControlServer {
    accept_task: JoinHandle<()>,
    state: Arc<ControlState>,
}

/// Bind a socket that processes in the container (any uid) can reach
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(listener)
}

impl ControlServer {
    pub fn start(context: ControlContext) -> Result<Self> {
        let listener = bind_socket(&context.sockets_dir.join(CONTROL_SOCKET))?;
        let state = Arc::new(ControlState {
            slots: Arc::new(Semaphore::new(context.max_subcontainers)),
            context,
            handles: Mutex::new(HashMap::new()),
            io_tasks: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let connection = tokio::spawn(Arc::clone(&accept_state).serve(stream));
                        accept_state.io_tasks.lock().push(connection);
                    }
                    Err(e) => {
                        warn!(error = %e, "Control socket accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self { accept_task, state })
    }

    /// Stop accepting requests and cut every stream. Sub-containers are
    /// released with the rest of the job.
    pub fn shutdown(self) {
        self.accept_task.abort();
        for task in self.state.io_tasks.lock().drain(..) {
            task.abort();
        }
        self.state.handles.lock().clear();
    }
}

impl ControlState {
    async fn serve(self: Arc<Self>, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Control connection closed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = match decode_request(&line) {
                Ok(request) => self.handle(request.command).await,
                Err(e) => ControlResponse::error(e.to_string()),
            };
            let frame = match encode_frame(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode control response");
                    break;
                }
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    }

    async fn handle(&self, command: ControlCommand) -> ControlResponse {
        let result = match command {
            ControlCommand::Run {
                image,
                workdir,
                command,
                memory,
                time,
                hard_time,
            } => self.run(image, workdir, command, memory, time, hard_time).await,
            ControlCommand::Signal { handle, signal } => self.signal(&handle, &signal).await,
            ControlCommand::Stdin { handle } => self.stdin(&handle),
            ControlCommand::Close { handle } => self.close(&handle).await,
        };
        result.unwrap_or_else(|e| ControlResponse::error(format!("{:#}", e)))
    }

    fn container_of(&self, handle: &str) -> Result<String> {
        self.handles
            .lock()
            .get(handle)
            .map(|sub| sub.container_id.clone())
            .with_context(|| format!("Unknown handle '{}'", handle))
    }

    async fn run(
        &self,
        image: String,
        workdir: String,
        command: Vec<String>,
        memory: u64,
        time: u64,
        hard_time: u64,
    ) -> Result<ControlResponse> {
        let ctx = &self.context;
        if command.is_empty() {
            anyhow::bail!("Empty command");
        }
        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| anyhow::anyhow!("Too many sub-containers (at most {})", ctx.max_subcontainers))?;

        let environment = if image.is_empty() {
            ctx.default_environment.clone()
        } else {
            image
        };
        let resolved = ctx
            .aliases
            .read()
            .get(&environment)
            .cloned()
            .with_context(|| format!("Unknown container '{}'", environment))?;

        let limits = Limits {
            time: if time == 0 { ctx.default_limits.time } else { time },
            hard_time: (hard_time != 0).then_some(hard_time),
            memory: if memory == 0 { ctx.default_limits.memory } else { memory },
            disk: ctx.default_limits.disk,
        };
        let memory_mb = limits.clamped_memory_mb(ctx.memory_ceiling_mb);

        let handle = format!("sub-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        let spec = ContainerSpec {
            name: format!("grader-{}-{}", ctx.job_id.simple(), handle),
            image: resolved,
            command: Some(command),
            workdir: Some(if workdir.is_empty() {
                DEFAULT_WORKDIR.to_string()
            } else {
                workdir
            }),
            memory_bytes: memory_mb << 20,
            binds: vec![BindMount::rw(
                ctx.student_dir.display().to_string(),
                format!("/task/{}", STUDENT_DIR),
            )],
        };
        let watch = WatchLimits {
            cpu_time: limits.time_limit(),
            hard_time: limits.hard_time_limit(),
            memory_bytes: memory_mb << 20,
        };

        ctx.supervisor.runtime.ensure_image(&spec.image).await?;
        let (container_id, io) = ctx
            .supervisor
            .launch(ctx.job_id, ContainerRole::Sub, &spec, watch)
            .await?;

        let output_socket = format!("{}.out", handle);
        let listener = match bind_socket(&ctx.sockets_dir.join(&output_socket)) {
            Ok(listener) => listener,
            Err(e) => {
                ctx.supervisor.release(&container_id).await;
                return Err(e);
            }
        };
        let pump = tokio::spawn(pump_output(listener, io.output));
        self.io_tasks.lock().push(pump);

        info!(job_id = %ctx.job_id, handle = %handle, container_id = %container_id, "Sub-container running");
        self.handles.lock().insert(
            handle.clone(),
            SubContainer {
                container_id,
                input: Some(io.input),
                _slot: slot,
            },
        );
        Ok(ControlResponse::Started {
            handle,
            output_socket,
        })
    }

    async fn signal(&self, handle: &str, signal: &str) -> Result<ControlResponse> {
        let container_id = self.container_of(handle)?;
        let delivered = match self.context.supervisor.runtime.kill(&container_id, signal).await {
            Ok(()) => true,
            Err(e) => {
                warn!(handle, error = %e, "Failed to signal sub-container");
                false
            }
        };
        Ok(ControlResponse::Signalled { delivered })
    }

    fn stdin(&self, handle: &str) -> Result<ControlResponse> {
        let input = {
            let mut handles = self.handles.lock();
            let sub = handles
                .get_mut(handle)
                .with_context(|| format!("Unknown handle '{}'", handle))?;
            sub.input.take().context("Stdin already requested")?
        };

        let input_socket = format!("{}.in", handle);
        let listener = bind_socket(&self.context.sockets_dir.join(&input_socket))?;
        let forward = tokio::spawn(forward_input(listener, input));
        self.io_tasks.lock().push(forward);
        Ok(ControlResponse::StdinReady { input_socket })
    }

    async fn close(&self, handle: &str) -> Result<ControlResponse> {
        let sub = self
            .handles
            .lock()
            .remove(handle)
            .with_context(|| format!("Unknown handle '{}'", handle))?;
        let supervisor = &self.context.supervisor;

        let mut exit_code = match supervisor.runtime.wait(&sub.container_id).await {
            Ok(code) => code,
            Err(e) => {
                warn!(handle, error = %e, "Waiting for sub-container failed");
                EXIT_WAIT_FAILED
            }
        };
        match supervisor.violation(&sub.container_id).await {
            Some(Violation::Timeout) => exit_code = EXIT_TIMEOUT,
            Some(Violation::Memory) => exit_code = EXIT_MEMORY,
            None => {}
        }
        supervisor.release(&sub.container_id).await;

        debug!(handle, exit_code, "Sub-container closed");
        Ok(ControlResponse::Closed { exit_code })
    }
}

/// Serve one consumer with the container's output frames
async fn pump_output(listener: UnixListener, mut output: BoxStream<'static, Result<OutputChunk>>) {
    let Ok((mut stream, _)) = listener.accept().await else {
        return;
    };
    while let Some(chunk) = output.next().await {
        let frame = match chunk {
            Ok(OutputChunk::Stdout(bytes)) => encode_output_frame(STREAM_STDOUT, &bytes),
            Ok(OutputChunk::Stderr(bytes)) => encode_output_frame(STREAM_STDERR, &bytes),
            Err(e) => {
                debug!(error = %e, "Sub-container output ended");
                break;
            }
        };
        if stream.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
}

async fn forward_input(listener: UnixListener, mut input: Pin<Box<dyn AsyncWrite + Send>>) {
    let Ok((mut stream, _)) = listener.accept().await else {
        return;
    };
    if let Err(e) = tokio::io::copy(&mut stream, &mut input).await {
        debug!(error = %e, "Sub-container stdin forwarding stopped");
    }
    let _ = input.shutdown().await;
}
