mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "grader-cli")]
#[command(about = "Grader CLI - Run submissions and manage agent task directories", long_about = None)]
struct Cli {
    /// Config file (defaults to $GRADER_CONFIG, then config/grader.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade one submission with the configured backend
    Run {
        /// Course id
        #[arg(long)]
        course: String,

        /// Task id
        #[arg(long)]
        task: String,

        /// Submission input: a JSON object of problem id → answer, or @file
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Attach the container's stdout and stderr to the result
        #[arg(long, default_value = "false")]
        debug: bool,
    },

    /// Print the content hashes of a task directory
    Hashes {
        /// Directory to hash (defaults to the configured tasks directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Push the configured tasks directory to one agent
    Sync {
        /// Agent base URL (e.g., http://agent-1:7070)
        #[arg(short, long)]
        agent: String,

        /// Only show what would change
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            course,
            task,
            input,
            debug,
        } => {
            let passed = commands::run_submission(&config, &course, &task, &input, debug).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Hashes { path } => {
            commands::print_hashes(path.as_deref().unwrap_or(&config.tasks_directory)).await?;
        }
        Commands::Sync { agent, dry_run } => {
            commands::sync_agent(&config, &agent, dry_run).await?;
        }
    }

    Ok(())
}
