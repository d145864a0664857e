// Shared container plumbing used by both job containers and nested
// sub-containers: launch under watch, consult the watchdogs, release.
use crate::arena::{ContainerArena, ContainerRole, WatchLimits};
use crate::memory_watchdog::MemoryWatchdog;
use crate::runtime::{AttachedIo, ContainerRuntime, ContainerSpec};
use crate::timeout_watchdog::TimeoutWatchdog;
use anyhow::Result;
use futures_util::future::join_all;
use grader_common::types::JobId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a watchdog killed a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    Timeout,
    Memory,
}

pub struct ContainerSupervisor {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub arena: ContainerArena,
    pub timeout: Arc<TimeoutWatchdog>,
    pub memory: Arc<MemoryWatchdog>,
}

impl ContainerSupervisor {
    /// Starts both watchdog loops on the current tokio runtime
    pub fn spawn(runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        Arc::new(Self {
            timeout: TimeoutWatchdog::spawn(Arc::clone(&runtime)),
            memory: MemoryWatchdog::spawn(Arc::clone(&runtime)),
            arena: ContainerArena::new(),
            runtime,
        })
    }

    /// Create, register and start a container with its stdio attached
    pub async fn launch(
        &self,
        job_id: JobId,
        role: ContainerRole,
        spec: &ContainerSpec,
        limits: WatchLimits,
    ) -> Result<(String, AttachedIo)> {
        let container_id = self.runtime.create(spec).await?;
        self.arena.insert(&container_id, job_id, role, limits);
        self.timeout.register(&container_id, limits.cpu_time, limits.hard_time);
        self.memory.register(&container_id, limits.memory_bytes);

        match self.attach_and_start(&container_id).await {
            Ok(io) => {
                info!(job_id = %job_id, container_id = %container_id, image = %spec.image, ?role, "Container started");
                Ok((container_id, io))
            }
            Err(e) => {
                self.release(&container_id).await;
                Err(e)
            }
        }
    }

    async fn attach_and_start(&self, container_id: &str) -> Result<AttachedIo> {
        let io = self.runtime.attach(container_id).await?;
        self.runtime.start(container_id).await?;
        Ok(io)
    }

    /// Ask both watchdogs whether they killed the container. Timeout wins;
    /// both records are consumed either way.
    pub async fn violation(&self, container_id: &str) -> Option<Violation> {
        self.memory.flush(container_id).await;
        let timed_out = self.timeout.did_time_out(container_id);
        let out_of_memory = self.memory.did_run_out_of_memory(container_id);
        if timed_out {
            Some(Violation::Timeout)
        } else if out_of_memory {
            Some(Violation::Memory)
        } else {
            None
        }
    }

    /// Unregister everywhere and remove the container from the engine
    pub async fn release(&self, container_id: &str) {
        self.timeout.unregister(container_id);
        self.memory.unregister(container_id);
        self.arena.remove(container_id);
        if let Err(e) = self.runtime.remove(container_id).await {
            warn!(container_id, error = %e, "Failed to remove container");
        }
    }

    /// Release every container, primary and nested, owned by a job
    pub async fn release_job(&self, job_id: JobId) {
        let containers = self.arena.job_containers(job_id);
        debug!(job_id = %job_id, count = containers.len(), "Releasing job containers");
        join_all(containers.iter().map(|id| self.release(id))).await;
    }
}
