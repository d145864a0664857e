use anyhow::Context;
use clap::Parser;
use grader_agent::{service, Agent, DockerRuntime};
use grader_common::config::GraderConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "grader-agentd")]
#[command(about = "Grading agent - runs submissions in containers for a remote backend", long_about = None)]
struct Args {
    /// Config file (defaults to $GRADER_CONFIG, then config/grader.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides agent.listen
    #[arg(short, long)]
    listen: Option<String>,

    /// Emit JSON log lines
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Grader agent booting...");

    let config = match &args.config {
        Some(path) => GraderConfig::load(path),
        None => GraderConfig::load_default(),
    }
    .map_err(|e| {
        error!("Failed to load grader configuration: {:#}", e);
        e
    })?;
    let listen = args.listen.unwrap_or_else(|| config.agent.listen.clone());

    info!(
        tasks = %config.tasks_directory.display(),
        tmp = %config.agent.tmp_dir.display(),
        concurrency = config.agent.concurrency,
        sync_enabled = config.agent.sync_enabled,
        aliases = config.image_aliases.len(),
        "Agent configured"
    );

    let runtime = DockerRuntime::connect()?;
    info!("Connected to Docker");

    let agent = Agent::new(Arc::new(runtime), &config);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(address = %listen, "Agent service listening");

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, stopping agent...");
    };

    tokio::select! {
        result = service::serve(listener, agent) => {
            result.context("Agent service failed")?;
        }
        _ = shutdown => {}
    }

    info!("Agent shutdown complete");
    Ok(())
}
