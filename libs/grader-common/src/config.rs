// Grader configuration shared by the agent daemon, the backend and the CLI
use crate::types::MIN_MEMORY_MB;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/grader.json";
pub const CONFIG_ENV: &str = "GRADER_CONFIG";
pub const TASKS_DIR_ENV: &str = "GRADER_TASKS_DIR";
pub const AGENT_LISTEN_ENV: &str = "GRADER_AGENT_LISTEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Root of the per-job working directories
    pub tmp_dir: PathBuf,
    pub memory_ceiling_mb: u64,
    /// Extra memory granted to the container for the control channel
    pub memory_headroom_mb: u64,
    pub max_subcontainers: usize,
    pub listen: String,
    /// When false the agent refuses task synchronisation
    pub sync_enabled: bool,
    /// Jobs run in parallel by one agent
    pub concurrency: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("tmp"),
            memory_ceiling_mb: 500,
            memory_headroom_mb: 10,
            max_subcontainers: 8,
            listen: "0.0.0.0:7070".to_string(),
            sync_enabled: true,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Local,
    RemotePool,
    RemoteManual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub mode: BackendMode,
    /// Agent base URLs. In `remote_pool` mode every entry is one connection
    /// slot, so an endpoint may be listed several times.
    pub agents: Vec<String>,
    pub sync_interval_secs: u64,
    pub reconnect_interval_secs: u64,
    /// Added to a job's hard time before the manager gives up on it
    pub supervision_overhead_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Local,
            agents: Vec::new(),
            sync_interval_secs: 30,
            reconnect_interval_secs: 10,
            supervision_overhead_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn supervision_overhead(&self) -> Duration {
        Duration::from_secs(self.supervision_overhead_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Content root laid out as `<course>/<task>/task.json`
    pub tasks_directory: PathBuf,
    /// Environment name → container image
    pub image_aliases: BTreeMap<String, String>,
    pub agent: AgentConfig,
    pub backend: BackendConfig,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            tasks_directory: PathBuf::from("tasks"),
            image_aliases: BTreeMap::new(),
            agent: AgentConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl GraderConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Grader config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let mut config: GraderConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `$GRADER_CONFIG` or `config/grader.json`; defaults when the
    /// default file does not exist
    pub fn load_default() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::load(default_path);
        }

        tracing::warn!(path = DEFAULT_CONFIG_PATH, "Config file not found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(TASKS_DIR_ENV) {
            self.tasks_directory = PathBuf::from(dir);
        }
        if let Ok(listen) = std::env::var(AGENT_LISTEN_ENV) {
            self.agent.listen = listen;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.memory_ceiling_mb < MIN_MEMORY_MB {
            bail!(
                "agent.memory_ceiling_mb must be at least {} (got {})",
                MIN_MEMORY_MB,
                self.agent.memory_ceiling_mb
            );
        }
        if self.agent.concurrency == 0 {
            bail!("agent.concurrency must be at least 1");
        }
        if self.backend.sync_interval_secs == 0 || self.backend.reconnect_interval_secs == 0 {
            bail!("backend intervals must be greater than zero");
        }
        match self.backend.mode {
            BackendMode::Local => {}
            BackendMode::RemotePool | BackendMode::RemoteManual => {
                if self.backend.agents.is_empty() {
                    bail!("backend.agents must list at least one agent in remote modes");
                }
            }
        }
        Ok(())
    }
}
