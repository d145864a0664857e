// CLI commands: one-shot grading and task directory maintenance
use anyhow::{bail, Context, Result};
use grader_agent::{ContainerRuntime, DockerRuntime};
use grader_backend::syncer::{self, SyncOutcome};
use grader_backend::{from_config, AgentClient, JobManager};
use grader_common::config::{BackendMode, GraderConfig};
use grader_common::sync;
use grader_common::task::TaskDescriptor;
use grader_common::types::{ResultKind, SubmissionInput};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub fn load_config(path: Option<&Path>) -> Result<GraderConfig> {
    match path {
        Some(path) => GraderConfig::load(path),
        None => GraderConfig::load_default(),
    }
}

/// `@path` reads the input from a file
pub fn parse_input(raw: &str) -> Result<SubmissionInput> {
    let text = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?,
        None => raw.to_string(),
    };
    let value: serde_json::Value = serde_json::from_str(&text).context("Submission input is not valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => bail!("Submission input must be a JSON object of problem id → answer"),
    }
}

/// Returns whether the submission passed
pub async fn run_submission(
    config: &GraderConfig,
    course_id: &str,
    task_id: &str,
    raw_input: &str,
    debug: bool,
) -> Result<bool> {
    let input = parse_input(raw_input)?;
    let task = TaskDescriptor::load(&config.tasks_directory, course_id, task_id)?;

    let runtime: Option<Arc<dyn ContainerRuntime>> = match config.backend.mode {
        BackendMode::Local => Some(Arc::new(DockerRuntime::connect()?)),
        BackendMode::RemotePool | BackendMode::RemoteManual => None,
    };
    let backend = from_config(config, runtime).await?;
    let manager = JobManager::start(backend, config.backend.supervision_overhead());

    println!("🚀 Grading {}/{} on the {} backend...", course_id, task_id, manager.backend().name());
    let result = manager.submit_job(Arc::new(task), input, debug).await;
    manager.shutdown();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.kind() == ResultKind::Success)
}

pub async fn print_hashes(root: &Path) -> Result<()> {
    let root = root.to_path_buf();
    let hashes = tokio::task::spawn_blocking(move || sync::directory_hashes(&root)).await??;
    println!("{}", serde_json::to_string_pretty(&hashes)?);
    Ok(())
}

pub async fn sync_agent(config: &GraderConfig, endpoint: &str, dry_run: bool) -> Result<()> {
    let client = AgentClient::new(endpoint);

    if dry_run {
        match syncer::plan(&client, &config.tasks_directory).await? {
            None => println!("⚠️  Agent {} does not accept synchronisation", client.endpoint()),
            Some(delta) if delta.is_empty() => println!("✅ Agent {} is up to date", client.endpoint()),
            Some(delta) => {
                for path in &delta.to_send {
                    println!("  send    {}", path);
                }
                for path in &delta.to_delete {
                    println!("  delete  {}", path);
                }
            }
        }
        return Ok(());
    }

    println!("📦 Synchronising {} with {}...", config.tasks_directory.display(), client.endpoint());
    match syncer::sync_agent(&client, &config.tasks_directory).await? {
        SyncOutcome::Skipped => println!("⚠️  Agent does not accept synchronisation"),
        SyncOutcome::UpToDate => println!("✅ Already up to date"),
        SyncOutcome::Updated { sent, deleted } => {
            println!("✅ Sent {} file(s), deleted {} file(s)", sent, deleted)
        }
    }
    Ok(())
}
