//! WorktreeManager: isolated `git worktree` workspaces per agent.
//!
//! `git worktree` has no `git2` API, so creation/removal is shelled out to
//! directly via `std::process::Command`, mirroring
//! `original_source/core/worktree_manager.py`. Branch/commit/status
//! operations inside an already-created worktree go through
//! [`crate::git::GitRepo`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::git::GitRepo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CleanupEntry {
    path: PathBuf,
    attempts: u32,
    next_try_at: f64,
    added_at: f64,
    reason: String,
}

pub struct WorktreeManager {
    project_dir: PathBuf,
    worktrees_base_dir: PathBuf,
    cleanup_queue_path: PathBuf,
}

impl WorktreeManager {
    pub fn new(project_dir: impl AsRef<Path>, worktrees_base_dir: impl AsRef<Path>) -> Result<Self> {
        let project_dir = project_dir.as_ref().canonicalize().with_context(|| {
            format!(
                "failed to resolve project directory {}",
                project_dir.as_ref().display()
            )
        })?;
        if !project_dir.join(".git").exists() {
            return Err(anyhow!("not a git repository: {}", project_dir.display()));
        }

        let worktrees_base_dir = worktrees_base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&worktrees_base_dir)?;

        let autocoder_dir = project_dir.join(".autocoder");
        std::fs::create_dir_all(&autocoder_dir)?;
        let cleanup_queue_path = autocoder_dir.join("cleanup_queue.json");

        info!(project_dir = %project_dir.display(), "worktree manager initialized");
        Ok(Self {
            project_dir,
            worktrees_base_dir,
            cleanup_queue_path,
        })
    }

    fn sanitize(agent_id: &str) -> String {
        agent_id.replace('/', "-").replace('\\', "-")
    }

    pub fn worktree_path(&self, agent_id: &str) -> PathBuf {
        self.worktrees_base_dir.join(Self::sanitize(agent_id))
    }

    pub fn get_worktree_path(&self, agent_id: &str) -> Option<PathBuf> {
        let path = self.worktree_path(agent_id);
        path.exists().then_some(path)
    }

    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .with_context(|| format!("failed to spawn git {args:?}"))
    }

    fn branch_exists(&self, name: &str) -> bool {
        self.run_git(&self.project_dir, &["rev-parse", "--verify", name])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn base_ref(&self) -> Option<&'static str> {
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Creates a worktree for `agent_id` on `branch_name`. Attaches to the
    /// branch if it already exists (resume after a restart); otherwise
    /// creates it from `main`/`master`.
    pub fn create_worktree(&self, agent_id: &str, branch_name: &str) -> Result<WorktreeInfo> {
        let worktree_path = self.worktree_path(agent_id);

        if worktree_path.exists() {
            warn!(path = %worktree_path.display(), "worktree already exists, removing before recreate");
            self.delete_worktree(agent_id, true)?;
        }

        info!(path = %worktree_path.display(), branch = branch_name, "creating worktree");

        let mut args: Vec<String> = vec![
            "worktree".into(),
            "add".into(),
            worktree_path.to_string_lossy().into_owned(),
        ];
        if self.branch_exists(branch_name) {
            args.push(branch_name.to_string());
        } else {
            args.push("-b".into());
            args.push(branch_name.to_string());
            if let Some(base) = self.base_ref() {
                args.push(base.to_string());
            }
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_git(&self.project_dir, &arg_refs)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "git worktree add failed");
            return Err(anyhow!("git worktree add failed: {stderr}"));
        }

        // Deeply nested worktree paths (project dir + agent id + source tree)
        // can exceed Windows' legacy MAX_PATH; without this, checkout silently
        // truncates or fails partway through on long paths. Best-effort: a
        // non-git-for-windows checkout won't recognize the key, and that's fine
        // since POSIX has no such limit.
        if let Err(e) = self.run_git(&worktree_path, &["config", "core.longpaths", "true"]) {
            warn!(error = %e, "failed to set core.longpaths on new worktree");
        }

        Ok(WorktreeInfo {
            worktree_path,
            branch_name: branch_name.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Removes a worktree and its git registration. Falls back to a forced
    /// directory removal, and finally to the deferred cleanup queue, if
    /// `git worktree remove` cannot clear it (e.g. a locked file on a
    /// network filesystem).
    pub fn delete_worktree(&self, agent_id: &str, force: bool) -> Result<bool> {
        let worktree_path = self.worktree_path(agent_id);
        if !worktree_path.exists() {
            debug!(agent_id, "worktree does not exist, nothing to delete");
            return Ok(false);
        }

        info!(path = %worktree_path.display(), "removing worktree");
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("-f");
        }
        let path_str = worktree_path.to_string_lossy().into_owned();
        args.push(&path_str);

        let output = self.run_git(&self.project_dir, &args)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "git worktree remove failed");
            if !force {
                return Ok(false);
            }
            let _ = self.run_git(&self.project_dir, &["worktree", "prune"]);
        }

        if worktree_path.exists() {
            if !force {
                error!("directory still exists after git worktree remove");
                return Ok(false);
            }
            if let Err(e) = std::fs::remove_dir_all(&worktree_path) {
                warn!(error = %e, "deferred cleanup for locked worktree");
                self.enqueue_cleanup(&worktree_path, "force-delete failed after git worktree remove")?;
                return Ok(true);
            }
        }

        info!("worktree deleted");
        Ok(true)
    }

    pub fn is_worktree_clean(&self, agent_id: &str) -> bool {
        let Some(path) = self.get_worktree_path(agent_id) else {
            return false;
        };
        match GitRepo::open(&path).and_then(|g| g.dirty_paths()) {
            Ok(paths) => paths.is_empty(),
            Err(_) => false,
        }
    }

    pub fn commit_checkpoint(&self, agent_id: &str, message: &str) -> Result<bool> {
        let Some(path) = self.get_worktree_path(agent_id) else {
            return Err(anyhow!("worktree not found for agent {agent_id}"));
        };
        let repo = GitRepo::open(&path)?;
        match repo.commit_all(&format!("Checkpoint: {message}")) {
            Ok(_) => {
                info!(agent_id, message, "checkpoint committed");
                Ok(true)
            }
            Err(e) => {
                if e.to_string().to_lowercase().contains("nothing to commit") {
                    debug!(agent_id, "no changes to commit");
                    return Ok(true);
                }
                Err(e)
            }
        }
    }

    pub fn rollback_to_last_checkpoint(&self, agent_id: &str, steps: u32) -> Result<bool> {
        let Some(path) = self.get_worktree_path(agent_id) else {
            return Err(anyhow!("worktree not found for agent {agent_id}"));
        };
        let output = self.run_git(&path, &["reset", "--hard", &format!("HEAD~{steps}")])?;
        if output.status.success() {
            info!(agent_id, steps, "rolled back to checkpoint");
            Ok(true)
        } else {
            error!(stderr = %String::from_utf8_lossy(&output.stderr), "rollback failed");
            Ok(false)
        }
    }

    // --- deferred cleanup queue -------------------------------------------

    fn load_cleanup_queue(&self) -> Vec<CleanupEntry> {
        let Ok(data) = std::fs::read_to_string(&self.cleanup_queue_path) else {
            return Vec::new();
        };
        serde_json::from_str(&data).unwrap_or_default()
    }

    fn save_cleanup_queue(&self, items: &[CleanupEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(items)?;
        std::fs::write(&self.cleanup_queue_path, json)?;
        Ok(())
    }

    fn enqueue_cleanup(&self, path: &Path, reason: &str) -> Result<()> {
        let mut items = self.load_cleanup_queue();
        let now = now_epoch();
        if let Some(existing) = items.iter_mut().find(|i| i.path == path) {
            existing.reason = reason.to_string();
            return self.save_cleanup_queue(&items);
        }
        items.push(CleanupEntry {
            path: path.to_path_buf(),
            attempts: 0,
            next_try_at: now,
            added_at: now,
            reason: reason.to_string(),
        });
        self.save_cleanup_queue(&items)
    }

    fn backoff_s(attempts: u32) -> f64 {
        (5.0 * 2f64.powi(attempts as i32)).min(600.0)
    }

    /// Best-effort retry of deferred deletions, capped at `max_items` per
    /// call so a stuck entry doesn't starve the orchestrator tick loop.
    pub fn process_cleanup_queue(&self, max_items: usize) -> Result<usize> {
        let items = self.load_cleanup_queue();
        if items.is_empty() {
            return Ok(0);
        }
        let now = now_epoch();
        let mut processed = 0usize;
        let mut remaining = Vec::new();

        for mut item in items {
            if processed >= max_items {
                remaining.push(item);
                continue;
            }
            if item.next_try_at > now {
                remaining.push(item);
                continue;
            }
            if !item.path.exists() {
                processed += 1;
                continue;
            }
            match std::fs::remove_dir_all(&item.path) {
                Ok(()) => {
                    processed += 1;
                }
                Err(e) => {
                    item.attempts += 1;
                    item.next_try_at = now + Self::backoff_s(item.attempts);
                    warn!(path = %item.path.display(), attempts = item.attempts, error = %e, "cleanup retry scheduled");
                    remaining.push(item);
                    processed += 1;
                }
            }
        }

        self.save_cleanup_queue(&remaining)?;
        Ok(processed)
    }

    pub fn list_worktrees(&self) -> HashMap<String, PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.worktrees_base_dir) else {
            return HashMap::new();
        };
        entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                (name, e.path())
            })
            .collect()
    }
}

fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use tempfile::TempDir;

    fn init_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("README.md"), "# test\n").unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        // git worktree requires a named branch, not detached HEAD.
        repo.set_head("refs/heads/main").unwrap_or(());
        drop(repo);
        let repo = Repository::open(dir.path()).unwrap();
        if repo.head().is_err() || repo.head().unwrap().shorthand() != Some("main") {
            let _ = Command::new("git")
                .args(["branch", "-M", "main"])
                .current_dir(dir.path())
                .output();
        }
        dir
    }

    #[test]
    fn creates_and_deletes_worktree() {
        let repo_dir = init_test_repo();
        let worktrees_dir = repo_dir.path().join("worktrees");
        let manager = WorktreeManager::new(repo_dir.path(), &worktrees_dir).unwrap();

        let info = manager.create_worktree("agent-1", "feat/test-1").unwrap();
        assert!(info.worktree_path.exists());
        assert!(manager.get_worktree_path("agent-1").is_some());

        assert!(manager.delete_worktree("agent-1", true).unwrap());
        assert!(manager.get_worktree_path("agent-1").is_none());
    }

    #[test]
    fn sanitizes_agent_id_with_slashes() {
        let repo_dir = init_test_repo();
        let worktrees_dir = repo_dir.path().join("worktrees");
        let manager = WorktreeManager::new(repo_dir.path(), &worktrees_dir).unwrap();
        let path = manager.worktree_path("team/agent-1");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "team-agent-1");
    }

    #[test]
    fn cleanup_queue_is_empty_with_no_entries() {
        let repo_dir = init_test_repo();
        let worktrees_dir = repo_dir.path().join("worktrees");
        let manager = WorktreeManager::new(repo_dir.path(), &worktrees_dir).unwrap();
        assert_eq!(manager.process_cleanup_queue(2).unwrap(), 0);
    }
}
