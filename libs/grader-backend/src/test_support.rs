// Agent services on loopback ports, backed by the scripted container runtime
use grader_agent::fake::FakeRuntime;
use grader_agent::{service, Agent};
use grader_common::config::GraderConfig;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct RemoteAgent {
    pub url: String,
    pub agent: Arc<Agent>,
    dir: TempDir,
    server: JoinHandle<std::io::Result<()>>,
}

impl RemoteAgent {
    pub fn tasks(&self) -> PathBuf {
        self.dir.path().join("tasks")
    }

    /// Close the listener; later connections are refused
    pub async fn stop(self) {
        self.server.abort();
        let _ = self.server.await;
    }
}

pub async fn spawn_agent(fake: FakeRuntime, aliases: BTreeMap<String, String>) -> RemoteAgent {
    spawn_configured(fake, |config| config.image_aliases = aliases).await
}

pub async fn spawn_configured(fake: FakeRuntime, configure: impl FnOnce(&mut GraderConfig)) -> RemoteAgent {
    let dir = TempDir::new().unwrap();
    let mut config = GraderConfig::default();
    config.tasks_directory = dir.path().join("tasks");
    config.agent.tmp_dir = dir.path().join("tmp");
    config.agent.concurrency = 4;
    configure(&mut config);

    let agent = Agent::new(Arc::new(fake), &config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(service::serve(listener, Arc::clone(&agent)));
    RemoteAgent {
        url,
        agent,
        dir,
        server,
    }
}

/// URL of a loopback port nothing listens on
pub async fn free_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}

pub fn write_task(tasks: &Path, task_id: &str, task: serde_json::Value) {
    let dir = tasks.join("course").join(task_id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("task.json"), task.to_string()).unwrap();
}
