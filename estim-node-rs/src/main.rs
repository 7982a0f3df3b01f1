//! Estim Node - live estimation session host
//!
//! # Usage
//!
//! ```bash
//! # Leader "maya", tasks from a file, defaults otherwise
//! estim-node --leader maya --tasks tasks.json
//!
//! # Everything from a config file, listen address overridden
//! estim-node --config estim.json --listen 0.0.0.0:9870
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use estim_core::Coordinator;
use estim_node::{collaborators, AdvisorConfig, JsonFileTaskSource, NodeConfig, Server};

/// Live consensus-estimation session host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display name that receives the leader role
    #[arg(long)]
    leader: Option<String>,

    /// Task list JSON file
    #[arg(short, long)]
    tasks: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Write final points and assignees to this file
    #[arg(long)]
    results: Option<PathBuf>,

    /// Connected voters required to start a round
    #[arg(long)]
    min_participants: Option<usize>,

    /// Seconds before an open round is force-revealed (0 = never)
    #[arg(long)]
    vote_timeout: Option<u64>,

    /// Shell command producing advisory estimates
    #[arg(long)]
    advisor_command: Option<String>,

    /// Shell command run on lifecycle events
    #[arg(long)]
    hook: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, mut config: NodeConfig) -> NodeConfig {
        if let Some(leader) = self.leader {
            config.leader = leader;
        }
        if let Some(tasks) = self.tasks {
            config = config.with_tasks_path(tasks);
        }
        if let Some(listen) = self.listen {
            config = config.with_listen(listen);
        }
        if let Some(results) = self.results {
            config = config.with_results_path(results);
        }
        if let Some(min) = self.min_participants {
            config.settings = config.settings.with_min_participants(min);
        }
        if let Some(secs) = self.vote_timeout {
            config.settings = config.settings.with_vote_timeout(secs);
        }
        if let Some(command) = self.advisor_command {
            let advisor = match config.advisor.take() {
                Some(advisor) => AdvisorConfig { command, ..advisor },
                None => AdvisorConfig::new("advisor", command),
            };
            config = config.with_advisor(advisor);
        }
        if let Some(hook) = self.hook {
            config = config.with_hook(hook);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let base = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    let config = args.apply(base);
    config.validate()?;

    let tasks_path = config
        .tasks_path
        .clone()
        .ok_or("no task list given (--tasks or tasksPath)")?;

    let source = JsonFileTaskSource::new(tasks_path);
    let (coordinator, handle) = Coordinator::from_source(
        &config.leader,
        config.settings.clone(),
        &source,
        collaborators(&config),
    )
    .await?;

    let server = Server::bind(config.listen, handle.clone()).await?;
    info!(
        "Session led by {} listening on ws://{}",
        config.leader,
        server.local_addr()?
    );

    let session = tokio::spawn(coordinator.run());
    let listener = tokio::spawn(server.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, ending session");
            let _ = handle.shutdown().await;
        }
        _ = handle.closed() => {}
    }
    drop(handle);

    let summary = session.await?;
    listener.abort();

    info!(
        "Session ended ({:?}): {}/{} tasks finalized, {} points",
        summary.reason,
        summary.totals.finalized_count,
        summary.totals.task_count,
        summary.totals.total_points
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
