//! `autocoder start`: spawn workers up to the configured cap and run the
//! tick loop until told to stop or (if `stop_when_done`) until the backlog
//! drains. Writes a PID file so `autocoder stop` can find this process.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::commands::{EXIT_ERROR, EXIT_SUCCESS};
use crate::orchestrator::Orchestrator;
use crate::runtime::Runtime;
use crate::store::Store;

const WORKER_COMMAND_ENV: &str = "AUTOCODER_WORKER_COMMAND";
const DEFAULT_WORKER_COMMAND: &str = "agent_worker";

pub fn pid_file_path(runtime: &Runtime) -> PathBuf {
    runtime.state_dir().join("orchestrator.pid")
}

fn write_pid_file(runtime: &Runtime) -> Result<()> {
    let path = pid_file_path(runtime);
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("writing pid file {}", path.display()))
}

fn remove_pid_file(runtime: &Runtime) {
    let path = pid_file_path(runtime);
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove pid file");
        }
    }
}

#[cfg(not(feature = "database"))]
pub async fn run(_runtime: Runtime, _agents_override: Option<u32>) -> Result<i32> {
    anyhow::bail!("the \"database\" feature is required to run `start`")
}

#[cfg(feature = "database")]
pub async fn run(runtime: Runtime, agents_override: Option<u32>) -> Result<i32> {
    let mut config = (*runtime.config).clone();
    if let Some(agents) = agents_override {
        config.orchestrator.max_agents = agents;
    }
    let runtime = Runtime {
        config: std::sync::Arc::new(config),
        ..runtime
    };

    let store = Store::open(runtime.pool.clone()).await?;

    let worker_command = std::env::var(WORKER_COMMAND_ENV)
        .unwrap_or_else(|_| DEFAULT_WORKER_COMMAND.to_string());

    let orchestrator = Orchestrator::new(runtime.clone(), store, PathBuf::from(worker_command))?;

    write_pid_file(&runtime)?;
    info!(pid = std::process::id(), "orchestrator starting");

    let result = orchestrator.run().await;

    remove_pid_file(&runtime);

    match result {
        Ok(()) => {
            info!("orchestrator stopped");
            Ok(EXIT_SUCCESS)
        }
        Err(err) => {
            tracing::error!(error = %err, "orchestrator run failed");
            Ok(EXIT_ERROR)
        }
    }
}
