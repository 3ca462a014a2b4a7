//! `autocoder verify <branch>`: one-shot Gatekeeper verify-and-merge pass,
//! independent of the tick loop. Useful for CI or manual re-verification.

use anyhow::Result;
use tracing::{error, info};

use crate::cli::commands::{EXIT_ERROR, EXIT_SUCCESS};
use crate::gatekeeper::{Gatekeeper, VerifyAndMergeOptions};
use crate::runtime::Runtime;
use crate::worktree::WorktreeManager;

pub fn run(runtime: &Runtime, branch: &str, allow_no_tests: bool) -> Result<i32> {
    let worktrees = WorktreeManager::new(&runtime.project_root, runtime.worktrees_dir())?;
    let gatekeeper = Gatekeeper::new(&runtime.project_root, worktrees);

    let result = gatekeeper.verify_and_merge(VerifyAndMergeOptions {
        branch_name: branch,
        agent_id: None,
        feature_id: None,
        main_branch: runtime.config.orchestrator.main_branch.as_deref(),
        fetch_remote: runtime.config.orchestrator.fetch_remote,
        push_remote: runtime.config.orchestrator.push_remote,
        allow_no_tests: allow_no_tests || runtime.config.orchestrator.allow_no_tests,
        delete_feature_branch: false,
    });

    if result.approved {
        info!(
            branch,
            merge_commit = result.merge_commit.as_deref().unwrap_or(""),
            "branch verified and merged"
        );
        Ok(EXIT_SUCCESS)
    } else {
        error!(branch, reason = %result.reason, "branch rejected");
        for (name, command_result) in &result.verification {
            if !command_result.passed {
                error!(command = name, errors = %command_result.errors, "verification command failed");
            }
        }
        Ok(EXIT_ERROR)
    }
}
