//! WorkerSupervisor: spawns and monitors the per-feature agent worker
//! processes. Grounded on `original_source/agent_worker.py`'s exact CLI
//! flag/env-var spawn contract and on `src/agents/process_manager.rs`'s
//! `tokio::process::Command` supervision pattern.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{GuardrailConfig, SdkRetryConfig};
use crate::ports::PortPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentModel {
    Opus,
    Sonnet,
    Haiku,
}

impl AgentModel {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentModel::Opus => "opus",
            AgentModel::Sonnet => "sonnet",
            AgentModel::Haiku => "haiku",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub project_dir: PathBuf,
    pub agent_id: String,
    pub feature_id: i64,
    pub worktree_path: PathBuf,
    pub model: AgentModel,
    pub max_iterations: u32,
    pub yolo: bool,
    pub heartbeat_seconds: u64,
    pub ports: PortPair,
    pub require_gatekeeper: bool,
    pub lock_dir: PathBuf,
}

#[derive(Debug)]
struct SupervisedWorker {
    child: Child,
    agent_id: String,
    feature_id: i64,
    spawned_at: Instant,
    sdk_retry_attempts: u32,
}

pub enum WorkerOutcome {
    Running,
    Exited { success: bool, code: Option<i32> },
}

/// Supervises spawned agent-worker subprocesses. One instance per
/// orchestrator process; not shared across process restarts (that's what
/// the database heartbeat table is for).
pub struct WorkerSupervisor {
    worker_command: PathBuf,
    guardrails: GuardrailConfig,
    sdk_retry: SdkRetryConfig,
    workers: Mutex<HashMap<String, SupervisedWorker>>,
}

impl WorkerSupervisor {
    /// `worker_command` is the executable that implements the agent loop
    /// (the Claude Code SDK driver); configurable so this engine doesn't
    /// hardcode a specific agent binary.
    pub fn new(worker_command: PathBuf, guardrails: GuardrailConfig, sdk_retry: SdkRetryConfig) -> Self {
        Self {
            worker_command,
            guardrails,
            sdk_retry,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_active(&self, agent_id: &str) -> bool {
        self.workers.lock().await.contains_key(agent_id)
    }

    pub async fn spawn(&self, spec: &SpawnSpec) -> Result<u32> {
        let mut command = Command::new(&self.worker_command);
        command
            .arg("--project-dir")
            .arg(&spec.project_dir)
            .arg("--agent-id")
            .arg(&spec.agent_id)
            .arg("--feature-id")
            .arg(spec.feature_id.to_string())
            .arg("--worktree-path")
            .arg(&spec.worktree_path)
            .arg("--model")
            .arg(spec.model.as_str())
            .arg("--max-iterations")
            .arg(spec.max_iterations.to_string())
            .arg("--heartbeat-seconds")
            .arg(spec.heartbeat_seconds.to_string())
            .arg("--api-port")
            .arg(spec.ports.api_port.to_string())
            .arg("--web-port")
            .arg(spec.ports.web_port.to_string());

        if spec.yolo {
            command.arg("--yolo");
        }

        command
            .env("AUTOCODER_AGENT_ID", &spec.agent_id)
            .env("AUTOCODER_API_PORT", spec.ports.api_port.to_string())
            .env("AUTOCODER_WEB_PORT", spec.ports.web_port.to_string())
            .env("API_PORT", spec.ports.api_port.to_string())
            .env("WEB_PORT", spec.ports.web_port.to_string())
            .env("PORT", spec.ports.api_port.to_string())
            .env("VITE_PORT", spec.ports.web_port.to_string())
            .env("AUTOCODER_LOCK_DIR", &spec.lock_dir)
            .env(
                "AUTOCODER_MAX_TOOL_CALLS",
                self.guardrails.max_tool_calls.to_string(),
            )
            .env(
                "AUTOCODER_MAX_CONSECUTIVE_TOOL_ERRORS",
                self.guardrails.max_consecutive_tool_errors.to_string(),
            )
            .env(
                "AUTOCODER_MAX_TOTAL_TOOL_ERRORS",
                self.guardrails.max_total_tool_errors.to_string(),
            );

        if spec.require_gatekeeper {
            command.env("AUTOCODER_REQUIRE_GATEKEEPER", "1");
        }

        command
            .current_dir(&spec.worktree_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn agent worker for {}", spec.agent_id))?;
        let pid = child.id().context("spawned child has no pid")?;

        info!(
            agent_id = %spec.agent_id,
            feature_id = spec.feature_id,
            pid,
            api_port = spec.ports.api_port,
            web_port = spec.ports.web_port,
            "spawned agent worker"
        );

        self.workers.lock().await.insert(
            spec.agent_id.clone(),
            SupervisedWorker {
                child,
                agent_id: spec.agent_id.clone(),
                feature_id: spec.feature_id,
                spawned_at: Instant::now(),
                sdk_retry_attempts: 0,
            },
        );

        Ok(pid)
    }

    /// Polls a supervised child without blocking. Returns `Exited` once and
    /// removes it from the active set; subsequent polls for the same
    /// `agent_id` return nothing.
    pub async fn poll(&self, agent_id: &str) -> Option<WorkerOutcome> {
        let mut guard = self.workers.lock().await;
        let worker = guard.get_mut(agent_id)?;
        match worker.child.try_wait() {
            Ok(Some(status)) => {
                let elapsed = worker.spawned_at.elapsed();
                guard.remove(agent_id);
                debug!(agent_id, elapsed_s = elapsed.as_secs(), "worker exited");
                Some(WorkerOutcome::Exited {
                    success: status.success(),
                    code: status.code(),
                })
            }
            Ok(None) => Some(WorkerOutcome::Running),
            Err(e) => {
                error!(agent_id, error = %e, "failed to poll worker status");
                guard.remove(agent_id);
                Some(WorkerOutcome::Exited {
                    success: false,
                    code: None,
                })
            }
        }
    }

    /// Kills the in-process `Child` handle for `agent_id`, if this
    /// supervisor instance holds one. Returns `false` when there is no
    /// tracked handle (e.g. after an orchestrator restart, where the real
    /// worker process may still be running unsupervised) so callers know to
    /// fall back to the PID-identity guard below.
    pub async fn kill(&self, agent_id: &str) -> Result<bool> {
        let mut guard = self.workers.lock().await;
        match guard.remove(agent_id) {
            Some(mut worker) => {
                worker.child.kill().await.ok();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether `pid` is still the worker process recorded at spawn time:
    /// same process identity (start-time ticks) and a cmdline that
    /// references this engine's worker entry point, not an unrelated
    /// process that happened to reuse the pid. Used by crash recovery to
    /// decide whether to signal a lingering worker directly when no
    /// in-process `Child` handle survived a restart.
    pub fn is_expected_worker_process(&self, pid: u32, recorded_start_ticks: Option<i64>) -> bool {
        let Some(recorded_start_ticks) = recorded_start_ticks else {
            return false;
        };
        let Ok(recorded_start_ticks) = u64::try_from(recorded_start_ticks) else {
            return false;
        };
        is_same_process(pid, recorded_start_ticks) && cmdline_references_worker(pid, &self.worker_command)
    }

    pub async fn feature_id_for(&self, agent_id: &str) -> Option<i64> {
        self.workers.lock().await.get(agent_id).map(|w| w.feature_id)
    }

    /// Second of the three distinct backoff policies in this engine: SDK
    /// transport-error retry/backoff for a single worker session, separate
    /// from the feature-level Store backoff and the worktree cleanup-queue
    /// backoff.
    pub async fn next_sdk_retry_delay(&self, agent_id: &str, is_rate_limit: bool) -> Option<Duration> {
        let mut guard = self.workers.lock().await;
        let worker = guard.get_mut(agent_id)?;
        if worker.sdk_retry_attempts >= self.sdk_retry.max_attempts {
            return None;
        }
        worker.sdk_retry_attempts += 1;
        let attempt = worker.sdk_retry_attempts;

        let base_delay = if is_rate_limit && attempt == 1 {
            self.sdk_retry.rate_limit_initial_delay_s as f64
        } else {
            self.sdk_retry.initial_delay_s as f64 * self.sdk_retry.exponential_base.powi(attempt as i32 - 1)
        };
        let capped = base_delay.min(self.sdk_retry.max_delay_s as f64);
        let jittered = if self.sdk_retry.jitter {
            let factor: f64 = rand::rng().random_range(0.7..=1.3);
            capped * factor
        } else {
            capped
        };

        warn!(agent_id, attempt, delay_s = jittered, "scheduling sdk retry");
        Some(Duration::from_secs_f64(jittered.max(0.0)))
    }
}

/// PID-identity crash check: the Orchestrator owns `Child` handles only for
/// workers it spawned this process lifetime. After a restart, a heartbeat
/// row's recorded pid may have been reused by an unrelated process; on
/// Linux this compares recorded process start time (`/proc/<pid>/stat`
/// field 22) to detect that case rather than trusting `pid` liveness alone.
#[cfg(target_os = "linux")]
pub fn is_same_process(pid: u32, recorded_start_ticks: u64) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Fields after the parenthesized comm name can contain spaces/parens, so
    // split on the last ')' rather than whitespace from the start.
    let Some(after_comm) = stat.rsplit_once(')') else {
        return false;
    };
    let fields: Vec<&str> = after_comm.1.split_whitespace().collect();
    // start_time is field 22 overall; fields[0] here is field 3 (state).
    let Some(start_time_field) = fields.get(19) else {
        return false;
    };
    start_time_field
        .parse::<u64>()
        .map(|t| t == recorded_start_ticks)
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
pub fn read_process_start_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = stat.rsplit_once(')')?;
    let fields: Vec<&str> = after_comm.1.split_whitespace().collect();
    fields.get(19)?.parse::<u64>().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn is_same_process(_pid: u32, _recorded_start_ticks: u64) -> bool {
    // Conservative: without a portable way to read process start time,
    // assume crashed so the orchestrator salvages/clears rather than
    // silently waiting on a pid that no longer belongs to the worker.
    false
}

#[cfg(not(target_os = "linux"))]
pub fn read_process_start_ticks(_pid: u32) -> Option<u64> {
    None
}

/// Checks `/proc/<pid>/cmdline` for a reference to the worker entry point's
/// file name, mirroring `original_source/tests/test_orchestrator_salvage.py`'s
/// `_is_expected_worker_process` (which inspects `psutil.Process.cmdline()`
/// for the `agent_worker.py` entry point before trusting a recorded pid).
#[cfg(target_os = "linux")]
fn cmdline_references_worker(pid: u32, worker_command: &std::path::Path) -> bool {
    let Some(marker) = worker_command.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    cmdline
        .split(|&b| b == 0)
        .any(|arg| String::from_utf8_lossy(arg).contains(marker))
}

#[cfg(not(target_os = "linux"))]
fn cmdline_references_worker(_pid: u32, _worker_command: &std::path::Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_tracks_active_worker() {
        let supervisor = WorkerSupervisor::new(
            PathBuf::from("true"),
            GuardrailConfig {
                max_tool_calls: 400,
                max_consecutive_tool_errors: 25,
                max_total_tool_errors: 150,
            },
            SdkRetryConfig {
                max_attempts: 3,
                initial_delay_s: 1,
                max_delay_s: 60,
                exponential_base: 2.0,
                jitter: false,
                rate_limit_initial_delay_s: 30,
            },
        );

        let dir = tempfile::TempDir::new().unwrap();
        let spec = SpawnSpec {
            project_dir: dir.path().to_path_buf(),
            agent_id: "agent-1".to_string(),
            feature_id: 1,
            worktree_path: dir.path().to_path_buf(),
            model: AgentModel::Sonnet,
            max_iterations: 5,
            yolo: false,
            heartbeat_seconds: 60,
            ports: PortPair {
                api_port: 5000,
                web_port: 5173,
            },
            require_gatekeeper: true,
            lock_dir: dir.path().join("locks"),
        };

        supervisor.spawn(&spec).await.unwrap();
        assert_eq!(supervisor.active_count().await, 1);

        // `true` exits immediately; poll until it's reaped.
        for _ in 0..50 {
            if let Some(WorkerOutcome::Exited { success, .. }) = supervisor.poll("agent-1").await {
                assert!(success);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker did not exit in time");
    }

    #[tokio::test]
    async fn sdk_retry_delay_exhausts_after_max_attempts() {
        let supervisor = WorkerSupervisor::new(
            PathBuf::from("sleep"),
            GuardrailConfig {
                max_tool_calls: 400,
                max_consecutive_tool_errors: 25,
                max_total_tool_errors: 150,
            },
            SdkRetryConfig {
                max_attempts: 2,
                initial_delay_s: 1,
                max_delay_s: 60,
                exponential_base: 2.0,
                jitter: false,
                rate_limit_initial_delay_s: 30,
            },
        );
        let dir = tempfile::TempDir::new().unwrap();
        let spec = SpawnSpec {
            project_dir: dir.path().to_path_buf(),
            agent_id: "agent-2".to_string(),
            feature_id: 2,
            worktree_path: dir.path().to_path_buf(),
            model: AgentModel::Haiku,
            max_iterations: 1,
            yolo: false,
            heartbeat_seconds: 60,
            ports: PortPair {
                api_port: 5001,
                web_port: 5174,
            },
            require_gatekeeper: false,
            lock_dir: dir.path().join("locks"),
        };
        supervisor.spawn(&spec).await.unwrap();

        assert!(supervisor.next_sdk_retry_delay("agent-2", false).await.is_some());
        assert!(supervisor.next_sdk_retry_delay("agent-2", false).await.is_some());
        assert!(supervisor.next_sdk_retry_delay("agent-2", false).await.is_none());

        supervisor.kill("agent-2").await.unwrap();
    }
}
