//! Orchestrator: the top-level tick loop tying Store, WorktreeManager,
//! Gatekeeper, PortAllocator and WorkerSupervisor together. Grounded on the
//! control flow implied by `original_source/core/gatekeeper.py`,
//! `worktree_manager.py`, and `agent_worker.py`'s exit-code contract (the
//! real `orchestrator.py` in this filtered corpus is truncated to imports).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::AutocoderConfig;
use crate::gatekeeper::{Gatekeeper, VerifyAndMergeOptions};
use crate::git::GitRepo;
use crate::logs::{prune_gatekeeper_artifacts, prune_worker_logs};
use crate::ports::PortAllocator;
use crate::runtime::Runtime;
use crate::store::models::{FeatureStatus, ReviewStatus};
use crate::store::Store;
use crate::supervisor::{AgentModel, SpawnSpec, WorkerOutcome, WorkerSupervisor};
use crate::worktree::WorktreeManager;

pub struct Orchestrator {
    runtime: Runtime,
    store: Store,
    worktrees: WorktreeManager,
    gatekeeper: Gatekeeper,
    ports: PortAllocator,
    supervisor: Arc<WorkerSupervisor>,
    config: Arc<AutocoderConfig>,
}

#[derive(Debug, Default)]
pub struct TickSummary {
    pub cleaned_worktrees: usize,
    pub pruned_logs: usize,
    pub pruned_artifacts: usize,
    pub blocked_features: usize,
    pub recovered_completed: usize,
    pub recovered_crashed: usize,
    pub merges_attempted: usize,
    pub merges_approved: usize,
    pub spawned: usize,
}

impl Orchestrator {
    pub fn new(runtime: Runtime, store: Store, worker_command: PathBuf) -> anyhow::Result<Self> {
        let config = runtime.config.clone();
        let project_root = runtime.project_root.clone();

        let worktrees = WorktreeManager::new(&project_root, project_root.join("worktrees"))?;
        let gatekeeper_worktrees = WorktreeManager::new(&project_root, project_root.join("worktrees"))?;
        let gatekeeper = Gatekeeper::new(&project_root, gatekeeper_worktrees);

        let ports = PortAllocator::new(
            (config.ports.api_port_range_start, config.ports.api_port_range_end),
            (config.ports.web_port_range_start, config.ports.web_port_range_end),
            !config.ports.skip_port_check,
        );

        let supervisor = Arc::new(WorkerSupervisor::new(
            worker_command,
            config.guardrails.clone(),
            config.sdk_retry.clone(),
        ));

        Ok(Self {
            runtime,
            store,
            worktrees,
            gatekeeper,
            ports,
            supervisor,
            config,
        })
    }

    /// One full orchestrator tick: cleanup, pruning, dependency blocking,
    /// crash/completion recovery, gatekeeper drive, and spawning new
    /// workers up to `max_agents`.
    pub async fn tick(&self) -> anyhow::Result<TickSummary> {
        let mut summary = TickSummary::default();

        summary.cleaned_worktrees = self.worktrees.process_cleanup_queue(2)?;

        let logs_dir = self.runtime.logs_dir();
        let artifacts_dir = self.runtime.project_root.join(".autocoder").join("gatekeeper");
        summary.pruned_logs = prune_worker_logs(&logs_dir, &self.config.logs).total_removed();
        summary.pruned_artifacts =
            prune_gatekeeper_artifacts(&artifacts_dir, &self.config.artifacts, &self.config.logs).total_removed();

        summary.blocked_features = self.store.block_unresolvable_dependencies().await?;

        summary.recovered_completed = self.recover_completed_agents().await?;
        summary.recovered_crashed = self.recover_crashed_agents().await?;

        let (attempted, approved) = self.drive_gatekeeper().await?;
        summary.merges_attempted = attempted;
        summary.merges_approved = approved;

        summary.spawned = self.spawn_workers_up_to(self.config.orchestrator.max_agents).await?;

        Ok(summary)
    }

    async fn recover_completed_agents(&self) -> anyhow::Result<usize> {
        let completed = self.store.get_completed_agents().await?;
        let mut recovered = 0;
        for agent in completed {
            debug!(agent_id = %agent.agent_id, "reaping completed agent record");
            self.store.remove_heartbeat(&agent.agent_id).await?;
            self.ports.release_ports(&agent.agent_id);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// For an agent whose heartbeat went stale, decide whether the branch
    /// has salvageable commits ahead of main (crash salvage — hand to the
    /// Gatekeeper rather than pre-judging an empty diff) or should simply be
    /// cleared and requeued.
    async fn recover_crashed_agents(&self) -> anyhow::Result<usize> {
        let stale = self
            .store
            .get_stale_agents(self.config.orchestrator.stale_timeout_minutes)
            .await?;
        let mut recovered = 0;

        for agent in stale {
            warn!(agent_id = %agent.agent_id, "agent heartbeat stale, treating as crashed");

            let killed_tracked_handle = self.supervisor.kill(&agent.agent_id).await.unwrap_or(false);
            if !killed_tracked_handle {
                if let Some(pid) = agent.pid {
                    if let Ok(pid) = u32::try_from(pid) {
                        if self.supervisor.is_expected_worker_process(pid, agent.start_ticks) {
                            warn!(agent_id = %agent.agent_id, pid, "lingering worker process outlived its supervisor handle, signaling it directly");
                            #[cfg(unix)]
                            {
                                use nix::sys::signal::{self, Signal};
                                use nix::unistd::Pid;
                                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                            }
                        }
                    }
                }
            }

            let Some(feature_id) = agent.feature_id else {
                self.store.mark_agent_crashed(&agent.agent_id).await?;
                self.store.remove_heartbeat(&agent.agent_id).await?;
                self.ports.release_ports(&agent.agent_id);
                continue;
            };
            let Some(feature) = self.store.get_feature(feature_id).await? else {
                self.store.mark_agent_crashed(&agent.agent_id).await?;
                self.store.remove_heartbeat(&agent.agent_id).await?;
                self.ports.release_ports(&agent.agent_id);
                continue;
            };

            let main_branch = self.config.orchestrator.main_branch.clone().unwrap_or_else(|| "main".to_string());
            let commits_ahead = GitRepo::open(&self.runtime.project_root)
                .and_then(|repo| repo.commits_ahead(&main_branch, &feature.branch_name.clone().unwrap_or_default()))
                .unwrap_or(0);

            if commits_ahead > 0 {
                info!(agent_id = %agent.agent_id, feature_id = feature.id, commits_ahead, "salvaging crashed agent's branch");
                self.store
                    .mark_feature_ready_for_verification(feature.id)
                    .await?;
                self.store.mark_agent_completed(&agent.agent_id).await?;
            } else {
                info!(agent_id = %agent.agent_id, feature_id = feature.id, "no salvageable commits, requeueing");
                self.store.requeue_feature(feature.id, false).await?;
                self.store.mark_agent_crashed(&agent.agent_id).await?;
            }

            self.store.remove_heartbeat(&agent.agent_id).await?;
            self.ports.release_ports(&agent.agent_id);
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn drive_gatekeeper(&self) -> anyhow::Result<(usize, usize)> {
        let ready = self
            .store
            .get_features_by_status(FeatureStatus::InProgress)
            .await?
            .into_iter()
            .filter(|f| f.review_status == ReviewStatus::ReadyForVerification.as_str())
            .collect::<Vec<_>>();

        let mut attempted = 0;
        let mut approved = 0;

        for feature in ready {
            let Some(branch_name) = feature.branch_name.clone() else {
                continue;
            };
            attempted += 1;

            let result = self.gatekeeper.verify_and_merge(VerifyAndMergeOptions {
                branch_name: &branch_name,
                agent_id: feature.assigned_agent_id.as_deref(),
                feature_id: Some(feature.id),
                main_branch: self.config.orchestrator.main_branch.as_deref(),
                fetch_remote: self.config.orchestrator.fetch_remote,
                push_remote: self.config.orchestrator.push_remote,
                allow_no_tests: self.config.orchestrator.allow_no_tests,
                delete_feature_branch: true,
            });

            if result.approved {
                approved += 1;
                self.store.mark_feature_passing(feature.id).await?;
                info!(feature_id = feature.id, branch = branch_name, "feature merged");
            } else {
                let errors = result
                    .verification
                    .iter()
                    .map(|(name, r)| format!("{name}: {}", r.errors))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.store
                    .mark_feature_failed(
                        feature.id,
                        &format!("{}\n{}", result.reason, errors),
                        result.artifact_path.as_deref(),
                        result.diff_fingerprint.as_deref(),
                        true,
                        None,
                        &(&self.config.feature_retry).into(),
                    )
                    .await?;
                warn!(feature_id = feature.id, reason = %result.reason, "feature rejected");
            }
        }

        Ok((attempted, approved))
    }

    async fn spawn_workers_up_to(&self, max_agents: u32) -> anyhow::Result<usize> {
        let mut spawned = 0;
        let active = self.supervisor.active_count().await as u32;
        let mut slots = max_agents.saturating_sub(active);

        while slots > 0 {
            let agent_id = format!("agent-{}", uuid::Uuid::new_v4());
            let Some(feature) = self
                .store
                .claim_next_pending_feature(
                    &agent_id,
                    "feat",
                    self.config.feature_retry.max_attempts,
                    self.config.orchestrator.prioritize_blockers,
                )
                .await?
            else {
                break;
            };

            let branch_name = feature
                .branch_name
                .clone()
                .unwrap_or_else(|| format!("feat/feature-{}-{}", feature.id, chrono::Utc::now().format("%Y%m%d-%H%M%S")));

            let worktree = self.worktrees.create_worktree(&agent_id, &branch_name)?;
            let ports = self.ports.allocate_ports(&agent_id)?;

            let spec = SpawnSpec {
                project_dir: self.runtime.project_root.clone(),
                agent_id: agent_id.clone(),
                feature_id: feature.id,
                worktree_path: worktree.worktree_path.clone(),
                model: AgentModel::Sonnet,
                max_iterations: 5,
                yolo: false,
                heartbeat_seconds: self.config.orchestrator.heartbeat_seconds,
                ports,
                require_gatekeeper: self.config.orchestrator.require_gatekeeper,
                lock_dir: self.runtime.locks_dir(),
            };

            match self.supervisor.spawn(&spec).await {
                Ok(pid) => {
                    let start_ticks = crate::supervisor::read_process_start_ticks(pid).map(|t| t as i64);
                    self.store
                        .register_agent(
                            &agent_id,
                            &worktree.worktree_path.to_string_lossy(),
                            feature.id,
                            pid as i64,
                            Some(chrono::Utc::now()),
                            ports.api_port as i64,
                            ports.web_port as i64,
                            None,
                            start_ticks,
                        )
                        .await?;
                    spawned += 1;
                    slots -= 1;
                }
                Err(e) => {
                    error!(agent_id, error = %e, "failed to spawn worker, requeueing feature");
                    self.store.requeue_feature(feature.id, true).await?;
                    self.ports.release_ports(&agent_id);
                    break;
                }
            }
        }

        Ok(spawned)
    }

    /// Reaps already-spawned workers whose process has exited, reconciling
    /// their outcome against the feature's final database state.
    pub async fn reap_exited_workers(&self, agent_ids: &[String]) -> anyhow::Result<()> {
        for agent_id in agent_ids {
            if let Some(WorkerOutcome::Exited { success, code }) = self.supervisor.poll(agent_id).await {
                let Some(feature_id) = self.supervisor.feature_id_for(agent_id).await else {
                    continue;
                };
                debug!(agent_id, success, ?code, "worker process exited");
                if let Some(feature) = self.store.get_feature(feature_id).await? {
                    if feature.status == FeatureStatus::InProgress.as_str()
                        && feature.review_status != ReviewStatus::ReadyForVerification.as_str()
                    {
                        self.store
                            .mark_feature_failed(
                                feature.id,
                                "Worker exited but feature not marked passing",
                                None,
                                None,
                                false,
                                None,
                                &(&self.config.feature_retry).into(),
                            )
                            .await?;
                    }
                }
                self.store.mark_agent_completed(agent_id).await?;
                self.store.remove_heartbeat(agent_id).await?;
                self.ports.release_ports(agent_id);
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.orchestrator.poll_interval_s)
    }

    /// Main run loop, exits when `stop_when_done` is set and no pending or
    /// in-progress work remains.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let summary = self.tick().await?;
            debug!(?summary, "tick complete");

            if self.config.orchestrator.stop_when_done {
                let stats = self.store.get_stats().await?;
                if stats.pending == 0 && stats.in_progress == 0 && self.supervisor.active_count().await == 0 {
                    info!("no pending or in-progress work remains, stopping");
                    return Ok(());
                }
            }

            if Self::shutdown_requested(self.poll_interval()).await {
                info!("received shutdown signal");
                return Ok(());
            }
        }
    }

    #[cfg(unix)]
    async fn shutdown_requested(poll_interval: Duration) -> bool {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return false,
        };
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => false,
            _ = tokio::signal::ctrl_c() => true,
            _ = term.recv() => true,
        }
    }

    #[cfg(not(unix))]
    async fn shutdown_requested(poll_interval: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => false,
            _ = tokio::signal::ctrl_c() => true,
        }
    }
}
