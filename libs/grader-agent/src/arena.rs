// Single authoritative table of the containers an agent currently owns.
// Watchdogs, jobs and the control server only hold container ids.
use grader_common::types::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    Primary,
    /// Nested container started through the control channel
    Sub,
}

/// Limits a container was registered with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchLimits {
    pub cpu_time: Duration,
    pub hard_time: Duration,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ContainerEntry {
    pub job_id: JobId,
    pub role: ContainerRole,
    pub limits: WatchLimits,
    pub started_at: Instant,
}

#[derive(Default)]
pub struct ContainerArena {
    containers: Mutex<HashMap<String, ContainerEntry>>,
}

impl ContainerArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container_id: &str, job_id: JobId, role: ContainerRole, limits: WatchLimits) {
        self.containers.lock().insert(
            container_id.to_string(),
            ContainerEntry {
                job_id,
                role,
                limits,
                started_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, container_id: &str) -> Option<ContainerEntry> {
        self.containers.lock().get(container_id).cloned()
    }

    pub fn remove(&self, container_id: &str) -> Option<ContainerEntry> {
        self.containers.lock().remove(container_id)
    }

    /// Every container (primary and nested) owned by `job_id`
    pub fn job_containers(&self, job_id: JobId) -> Vec<String> {
        self.containers
            .lock()
            .iter()
            .filter(|(_, entry)| entry.job_id == job_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count_subcontainers(&self, job_id: JobId) -> usize {
        self.containers
            .lock()
            .values()
            .filter(|entry| entry.job_id == job_id && entry.role == ContainerRole::Sub)
            .count()
    }

    pub fn len(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.lock().is_empty()
    }
}
