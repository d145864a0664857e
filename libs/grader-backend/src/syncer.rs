/// Directory Syncer - Master Side
///
/// **Core Responsibility:**
/// Bring a remote agent's copy of the task directory in line with the
/// master's: compare content hashes, push changed or new files as one
/// compressed archive, and list the files the agent must delete.
///
/// The agent validates every path before applying anything, so a rejected
/// update leaves its directory untouched.
use crate::client::AgentClient;
use anyhow::{Context, Result};
use grader_common::protocol::UpdateDirectoryRequest;
use grader_common::sync::{self, SyncDelta};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The agent has synchronisation disabled
    Skipped,
    UpToDate,
    Updated { sent: usize, deleted: usize },
}

/// What would have to change on the agent, without touching it
pub async fn plan(client: &AgentClient, tasks_directory: &Path) -> Result<Option<SyncDelta>> {
    let Some(remote) = client.directory_hashes().await? else {
        return Ok(None);
    };
    let root = tasks_directory.to_path_buf();
    let master = tokio::task::spawn_blocking(move || sync::directory_hashes(&root))
        .await
        .context("Hashing task directory panicked")??;
    Ok(Some(sync::compare(&master, &remote)))
}

pub async fn sync_agent(client: &AgentClient, tasks_directory: &Path) -> Result<SyncOutcome> {
    let Some(delta) = plan(client, tasks_directory).await? else {
        debug!(endpoint = %client.endpoint(), "Agent does not accept synchronisation");
        return Ok(SyncOutcome::Skipped);
    };
    if delta.is_empty() {
        debug!(endpoint = %client.endpoint(), "Agent tasks up to date");
        return Ok(SyncOutcome::UpToDate);
    }

    let root: PathBuf = tasks_directory.to_path_buf();
    let SyncDelta { to_send, to_delete } = delta;
    let sent = to_send.len();
    let deleted = to_delete.len();
    let archive = tokio::task::spawn_blocking(move || sync::pack_archive(&root, &to_send))
        .await
        .context("Packing task archive panicked")??;

    client
        .update_directory(&UpdateDirectoryRequest::new(&archive, to_delete))
        .await?;
    info!(endpoint = %client.endpoint(), sent, deleted, "Agent tasks synchronised");
    Ok(SyncOutcome::Updated { sent, deleted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_agent, spawn_configured, write_task};
    use grader_agent::fake::FakeRuntime;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sync_sends_changes_then_settles() {
        let master = TempDir::new().unwrap();
        write_task(master.path(), "hello", json!({"environment": "python"}));
        fs::write(master.path().join("course/hello/run.py"), "print('hi')").unwrap();

        let remote = spawn_agent(FakeRuntime::new(), BTreeMap::new()).await;
        write_task(&remote.tasks(), "stale", json!({}));
        let client = AgentClient::new(&remote.url);

        let outcome = sync_agent(&client, master.path()).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Updated { sent: 2, deleted: 1 });
        assert_eq!(
            fs::read_to_string(remote.tasks().join("course/hello/run.py")).unwrap(),
            "print('hi')"
        );
        assert!(!remote.tasks().join("course/stale/task.json").exists());

        assert_eq!(sync_agent(&client, master.path()).await.unwrap(), SyncOutcome::UpToDate);

        fs::write(master.path().join("course/hello/run.py"), "print('bye')").unwrap();
        let delta = plan(&client, master.path()).await.unwrap().unwrap();
        assert_eq!(delta.to_send, vec!["course/hello/run.py".to_string()]);
        assert!(delta.to_delete.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_agent_is_skipped() {
        let master = TempDir::new().unwrap();
        write_task(master.path(), "hello", json!({}));
        let remote = spawn_configured(FakeRuntime::new(), |config| config.agent.sync_enabled = false).await;
        let client = AgentClient::new(&remote.url);

        assert_eq!(sync_agent(&client, master.path()).await.unwrap(), SyncOutcome::Skipped);
        assert!(!remote.tasks().join("course/hello/task.json").exists());
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_an_error() {
        let master = TempDir::new().unwrap();
        let client = AgentClient::new(&crate::test_support::free_port_url().await);
        let err = sync_agent(&client, master.path()).await.unwrap_err();
        let agent_error = err.downcast_ref::<crate::client::AgentError>().unwrap();
        assert!(agent_error.is_unreachable());
    }
}
