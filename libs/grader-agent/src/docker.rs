/// Docker Runtime - Production `ContainerRuntime`
///
/// **Docker Execution Rules:**
/// 1. Pulls the requested image if not present
/// 2. Creates containers with security constraints:
///    - Network disabled
///    - Memory limit enforced, swap disabled (`memory_swap == memory`)
///    - Only the job's own directories bind-mounted
/// 3. Attaches stdio before start so no output is lost
/// 4. Measures CPU time and memory through the stats endpoint
/// 5. Streams `oom` events from the daemon event bus
use crate::runtime::{AttachedIo, BindMount, ContainerRuntime, ContainerSpec, OutputChunk};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const MANAGED_LABEL: &str = "grader.managed";

/// Container already removed (404) or already stopped (409)
fn is_gone(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    async fn stats(&self, container_id: &str) -> Option<bollard::container::Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(container_id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Some(stats),
            Some(Err(e)) => {
                debug!(container_id, error = %e, "Stats unavailable");
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image cache hit: {}", image);
            return Ok(());
        }

        warn!("Image cache miss: {} (pulling now)", image);
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.with_context(|| format!("Failed to pull Docker image '{}'", image))?;
        }

        info!("Image pulled successfully: {}", image);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            working_dir: spec.workdir.clone(),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes as i64),
                memory_swap: Some(spec.memory_bytes as i64),
                network_mode: Some("none".to_string()),
                binds: Some(spec.binds.iter().map(BindMount::spec).collect()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("Failed to create container from '{}'", spec.image))?;
        Ok(container.id)
    }

    async fn attach(&self, container_id: &str) -> Result<AttachedIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(container_id, Some(options))
            .await
            .context("Failed to attach to container")?;

        let output = output
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(OutputChunk::Stdout(message.to_vec())))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(OutputChunk::Stderr(message.to_vec())))
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(anyhow::Error::new(e).context("Container output stream failed"))),
                }
            })
            .boxed();

        Ok(AttachedIo { output, input })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(anyhow::Error::new(e).context("Failed to wait for container")),
            None => bail!("No wait response from container {}", container_id),
        }
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<()> {
        let options = KillContainerOptions { signal };
        match self.docker.kill_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to kill container")),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to remove container")),
        }
    }

    async fn cpu_time(&self, container_id: &str) -> Option<Duration> {
        let stats = self.stats(container_id).await?;
        Some(Duration::from_nanos(stats.cpu_stats.cpu_usage.total_usage))
    }

    async fn peak_memory(&self, container_id: &str) -> Option<u64> {
        let stats = self.stats(container_id).await?;
        // cgroup v2 hosts do not report max_usage
        stats.memory_stats.max_usage.or(stats.memory_stats.usage)
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn oom_events(&self, container_id: &str) -> BoxStream<'static, ()> {
        let filters = HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            ("event".to_string(), vec!["oom".to_string()]),
            ("container".to_string(), vec![container_id.to_string()]),
        ]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };
        self.docker
            .events(Some(options))
            .filter_map(|event| async move { event.ok().map(|_| ()) })
            .boxed()
    }
}
