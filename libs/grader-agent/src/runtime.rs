/// Container Runtime - Seam Between the Agent and the Container Engine
///
/// **Core Responsibility:**
/// Describe every container operation the Agent, the watchdogs and the
/// sub-container control server need, without naming a concrete engine.
///
/// **Critical Architectural Boundary:**
/// - The runtime knows HOW to create, run and measure containers
/// - The runtime does NOT know about jobs, limits policy or results
/// - Production uses `DockerRuntime`; tests use a scripted in-memory fake
///
/// **Idempotency:**
/// `kill` and `remove` on a container that is already gone succeed.
/// Measurements on a gone container return `None` ("not applicable").
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Host directory mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn rw(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    /// Docker `Binds` syntax
    pub fn spec(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host, self.container, mode)
    }
}

/// Everything needed to create one sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `None` keeps the image's default command
    pub command: Option<Vec<String>>,
    pub workdir: Option<String>,
    /// Hard memory limit; swap is disabled by setting the same value
    pub memory_bytes: u64,
    pub binds: Vec<BindMount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Live stdio of a container, obtained before it starts
pub struct AttachedIo {
    pub output: BoxStream<'static, Result<OutputChunk>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Returns the container id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn attach(&self, container_id: &str) -> Result<AttachedIo>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Blocks until the container is no longer running; returns its exit code
    async fn wait(&self, container_id: &str) -> Result<i64>;

    /// `signal` is a name (`SIGKILL`) or a number (`9`)
    async fn kill(&self, container_id: &str, signal: &str) -> Result<()>;

    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Accumulated CPU time, `None` when the container is gone
    async fn cpu_time(&self, container_id: &str) -> Option<Duration>;

    /// Peak memory usage in bytes, `None` when the container is gone
    async fn peak_memory(&self, container_id: &str) -> Option<u64>;

    /// Whether the engine reports the container as killed by the OOM killer
    async fn oom_killed(&self, container_id: &str) -> bool;

    /// One item per out-of-memory notification for this container
    fn oom_events(&self, container_id: &str) -> BoxStream<'static, ()>;
}
