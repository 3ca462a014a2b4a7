//! `autocoder status`: print backlog and agent statistics as JSON.

use anyhow::Result;
use serde::Serialize;

use crate::cli::commands::{EXIT_ERROR, EXIT_SUCCESS};
use crate::runtime::Runtime;
use crate::store::models::{PendingQueueState, Progress, Stats};
use crate::store::Store;

#[derive(Debug, Serialize)]
struct StatusReport {
    stats: Stats,
    progress: Progress,
    pending_queue: PendingQueueState,
    active_agents: usize,
}

#[cfg(not(feature = "database"))]
pub async fn run(_runtime: &Runtime) -> Result<i32> {
    anyhow::bail!("the \"database\" feature is required to run `status`")
}

#[cfg(feature = "database")]
pub async fn run(runtime: &Runtime) -> Result<i32> {
    let store = Store::open(runtime.pool.clone()).await?;

    let stats = store.get_stats().await?;
    let progress = store.get_progress().await?;
    let pending_queue = store.get_pending_queue_state().await?;
    let active_agents = store.get_active_agents().await?.len();

    let report = StatusReport {
        stats,
        progress,
        pending_queue,
        active_agents,
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!("{json}");
            Ok(EXIT_SUCCESS)
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize status report");
            Ok(EXIT_ERROR)
        }
    }
}
