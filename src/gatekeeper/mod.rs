//! Gatekeeper: the only component allowed to write to the main branch.
//!
//! A deterministic verify-and-merge protocol, grounded on
//! `original_source/core/gatekeeper.py`: merge the feature branch into a
//! disposable temp worktree, run the project's verification commands there,
//! and only if they all pass, commit the merge and advance local main to it.

pub mod project_config;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::worktree::WorktreeManager;
use project_config::{
    infer_preset, load_project_config, synthesize_commands_from_preset, CommandSpec, ReviewMode,
    ReviewSpec, ReviewerType,
};

const IGNORED_DIRTY_SUBSTRINGS: &[&str] = &[
    ".autocoder/",
    "worktrees/",
    "agent_system.db",
    ".eslintrc.json",
];

const ORDERED_COMMANDS: &[&str] = &["test", "lint", "typecheck", "format", "build", "acceptance"];

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub command: String,
    pub output: String,
    pub errors: String,
    pub allow_fail: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
}

/// Outcome of the optional reviewer gate (`ReviewSpec`). Only produced when
/// `review.mode != ReviewMode::Off` and a reviewer command is configured.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub approved: bool,
    pub reason: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyAndMergeResult {
    pub approved: bool,
    pub reason: String,
    pub verification: Vec<(String, CommandResult)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_fingerprint: Option<String>,
    pub push_failed: bool,
    pub merge_conflict: bool,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewOutcome>,
}

impl VerifyAndMergeResult {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            verification: Vec::new(),
            merge_commit: None,
            diff_fingerprint: None,
            push_failed: false,
            merge_conflict: false,
            timestamp: Utc::now(),
            artifact_path: None,
            review: None,
        }
    }
}

pub struct VerifyAndMergeOptions<'a> {
    pub branch_name: &'a str,
    pub agent_id: Option<&'a str>,
    pub feature_id: Option<i64>,
    pub main_branch: Option<&'a str>,
    pub fetch_remote: bool,
    pub push_remote: bool,
    pub allow_no_tests: bool,
    pub delete_feature_branch: bool,
}

pub struct Gatekeeper {
    project_dir: PathBuf,
    worktree_manager: WorktreeManager,
}

impl Gatekeeper {
    pub fn new(project_dir: impl AsRef<Path>, worktree_manager: WorktreeManager) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            worktree_manager,
        }
    }

    fn run_git(&self, dir: &Path, args: &[&str]) -> std::io::Result<std::process::Output> {
        Command::new("git").args(args).current_dir(dir).output()
    }

    fn detect_main_branch(&self, requested: Option<&str>) -> String {
        if let Some(b) = requested {
            return b.to_string();
        }
        if let Ok(env_branch) = std::env::var("AUTOCODER_MAIN_BRANCH") {
            if !env_branch.is_empty() {
                return env_branch;
            }
        }
        for candidate in ["main", "master"] {
            if self
                .run_git(&self.project_dir, &["rev-parse", "--verify", candidate])
                .map(|o| o.status.success())
                .unwrap_or(false)
            {
                return candidate.to_string();
            }
        }
        self.run_git(&self.project_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "main".to_string())
    }

    fn origin_exists(&self) -> bool {
        self.run_git(&self.project_dir, &["remote", "get-url", "origin"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn porcelain_status(&self) -> Vec<String> {
        self.run_git(&self.project_dir, &["status", "--porcelain"])
            .map(|o| {
                String::from_utf8_lossy(&o.stdout)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn split_dirty(lines: &[String]) -> (Vec<String>, Vec<String>) {
        let mut ignored = Vec::new();
        let mut remaining = Vec::new();
        for line in lines {
            let normalized = line.replace('\\', "/");
            if IGNORED_DIRTY_SUBSTRINGS.iter().any(|s| normalized.contains(s)) {
                ignored.push(line.clone());
            } else {
                remaining.push(line.clone());
            }
        }
        (ignored, remaining)
    }

    fn expand_placeholders(command: &str, project_dir: &Path) -> String {
        let py = find_python_interpreter();
        let venv_py = if cfg!(windows) {
            project_dir.join(".venv").join("Scripts").join("python.exe")
        } else {
            project_dir.join(".venv").join("bin").join("python")
        };
        command
            .replace("{PY}", &py)
            .replace("{VENV_PY}", &venv_py.to_string_lossy().replace('\\', "/"))
    }

    fn select_node_install_command(project_dir: &Path) -> Option<String> {
        if !project_dir.join("package.json").exists() {
            return None;
        }
        if project_dir.join("pnpm-lock.yaml").exists() && which("pnpm") {
            return Some("pnpm install --frozen-lockfile".to_string());
        }
        if project_dir.join("yarn.lock").exists() && which("yarn") {
            return Some("yarn install --frozen-lockfile".to_string());
        }
        if project_dir.join("package-lock.json").exists() && which("npm") {
            return Some("npm ci".to_string());
        }
        if which("npm") {
            return Some("npm install".to_string());
        }
        None
    }

    fn run_shell(command: &str, cwd: &Path, timeout_s: Option<u64>) -> CommandResult {
        let expanded = Self::expand_placeholders(command, cwd);
        let shell_arg = if cfg!(windows) { "/C" } else { "-c" };
        let shell = if cfg!(windows) { "cmd" } else { "sh" };

        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg).arg(&expanded).current_dir(cwd);

        // Bound by a best-effort wall-clock timeout via std::thread, since
        // std::process has no native timeout; the Supervisor's async path
        // uses tokio's, but Gatekeeper commands run synchronously on the
        // orchestrator tick thread.
        match run_with_timeout(cmd, timeout_s.map(Duration::from_secs)) {
            Ok(output) => CommandResult {
                success: true,
                passed: output.status.success(),
                exit_code: output.status.code(),
                command: expanded,
                output: String::from_utf8_lossy(&output.stdout).to_string(),
                errors: String::from_utf8_lossy(&output.stderr).to_string(),
                allow_fail: false,
                timeout: None,
            },
            Err(TimeoutOrIoError::TimedOut) => CommandResult {
                success: false,
                passed: false,
                exit_code: None,
                command: expanded,
                output: String::new(),
                errors: format!("Timed out after {:?}", timeout_s),
                allow_fail: false,
                timeout: Some(true),
            },
            Err(TimeoutOrIoError::Io(e)) => CommandResult {
                success: false,
                passed: false,
                exit_code: None,
                command: expanded,
                output: String::new(),
                errors: e.to_string(),
                allow_fail: false,
                timeout: None,
            },
        }
    }

    fn apply_allow_no_tests(result: CommandResult, allow_no_tests: bool) -> CommandResult {
        if !allow_no_tests || !Self::is_yolo_mode() {
            return result;
        }
        if !result.success || result.passed {
            return result;
        }
        let combined = format!("{} {}", result.output, result.errors).to_lowercase();
        let cmd_lower = result.command.to_lowercase();

        let no_script = cmd_lower.contains("npm") && combined.contains("missing script") && combined.contains("\"test\"");
        let pytest_empty = (cmd_lower.contains("pytest") && result.exit_code == Some(5))
            || combined.contains("collected 0 items");

        if no_script || pytest_empty {
            let mut r = result;
            r.passed = true;
            return r;
        }
        result
    }

    fn is_yolo_mode() -> bool {
        std::env::var("AUTOCODER_ALLOW_NO_TESTS")
            .map(|v| !matches!(v.to_lowercase().as_str(), "" | "0" | "false" | "no" | "off"))
            .unwrap_or(false)
    }

    fn compute_diff_fingerprint(cwd: &Path) -> Option<String> {
        let output = Command::new("git")
            .args(["diff", "--cached", "--no-color", "--no-ext-diff"])
            .current_dir(cwd)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let normalized = String::from_utf8_lossy(&output.stdout).replace("\r\n", "\n");
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Some(format!("{:x}", hasher.finalize()))
    }

    fn write_artifact(
        &self,
        subdir: &str,
        feature_id: Option<i64>,
        result: &mut VerifyAndMergeResult,
    ) {
        let out_dir = match feature_id {
            Some(id) => self
                .project_dir
                .join(".autocoder")
                .join("features")
                .join(id.to_string())
                .join(subdir),
            None => self.project_dir.join(".autocoder").join(subdir),
        };
        if std::fs::create_dir_all(&out_dir).is_err() {
            return;
        }
        let stamp = result.timestamp.format("%Y%m%d_%H%M%S_%f");
        let path = out_dir.join(format!("{stamp}.json"));
        if let Ok(json) = serde_json::to_string_pretty(result) {
            if std::fs::write(&path, json).is_ok() {
                result.artifact_path = Some(path);
            }
        }
    }

    fn run_ordered_commands(
        command_specs: &std::collections::BTreeMap<String, CommandSpec>,
        workdir: &Path,
        allow_no_tests: bool,
    ) -> Result<Vec<(String, CommandResult)>, (String, Vec<(String, CommandResult)>)> {
        let mut verification = Vec::new();

        if let Some(setup) = command_specs.get("setup") {
            let mut setup_cmd = setup.command.clone();
            if setup_cmd.trim() == "npm install" {
                if let Some(selected) = Self::select_node_install_command(workdir) {
                    setup_cmd = selected;
                }
            }
            let mut result = Self::run_shell(&setup_cmd, workdir, setup.timeout_s);
            result.allow_fail = setup.allow_fail;
            let failed = !result.passed && !result.allow_fail;
            verification.push(("setup".to_string(), result));
            if failed {
                return Err(("Setup failed".to_string(), verification));
            }
        }

        let mut seen: std::collections::HashSet<&str> = ["setup"].into_iter().collect();
        let mut ordered: Vec<&str> = ORDERED_COMMANDS.to_vec();
        let mut extra: Vec<&str> = command_specs
            .keys()
            .map(String::as_str)
            .filter(|k| !ORDERED_COMMANDS.contains(k) && *k != "setup")
            .collect();
        extra.sort_unstable();
        ordered.extend(extra);

        for name in ordered {
            if seen.contains(name) {
                continue;
            }
            let Some(spec) = command_specs.get(name) else {
                continue;
            };
            seen.insert(name);
            let mut result = Self::run_shell(&spec.command, workdir, spec.timeout_s);
            result.allow_fail = spec.allow_fail;
            if name == "test" {
                result = Self::apply_allow_no_tests(result, allow_no_tests);
            }
            let failed = (!result.success || !result.passed) && !result.allow_fail;
            verification.push((name.to_string(), result));
            if failed {
                return Err((format!("Verification command failed: {name}"), verification));
            }
        }

        Ok(verification)
    }

    /// Runs the optional reviewer gate (`ReviewSpec`) once deterministic
    /// verification has passed. `ReviewMode::Off` and an unconfigured
    /// reviewer command are both no-ops; `claude`/`multi_cli` reviewer types
    /// are rejected outright since this engine only supports a shell command
    /// reviewer. In `ReviewMode::Gate`, a rejecting reviewer blocks the
    /// merge; in `ReviewMode::Advisory` it's recorded but never blocks.
    fn run_review_gate(
        &self,
        review: &ReviewSpec,
        workdir: &Path,
    ) -> Result<Option<ReviewOutcome>, (String, Option<ReviewOutcome>)> {
        if review.mode == ReviewMode::Off {
            return Ok(None);
        }

        match &review.reviewer_type {
            ReviewerType::Unsupported(name) => {
                return Err((format!("Unsupported reviewer type: {name}"), None));
            }
            ReviewerType::None => return Ok(None),
            ReviewerType::Command => {}
        }

        let Some(command) = review.command.as_deref() else {
            return Ok(None);
        };

        let result = Self::run_shell(command, workdir, review.timeout_s);
        let outcome = ReviewOutcome {
            approved: result.passed,
            reason: if result.passed {
                "review command approved the change".to_string()
            } else {
                "review command rejected the change".to_string()
            },
            output: if result.passed { result.output } else { result.errors },
        };

        if review.mode == ReviewMode::Gate && !outcome.approved {
            return Err(("Review gate rejected the change".to_string(), Some(outcome)));
        }
        Ok(Some(outcome))
    }

    /// Full verify-and-merge protocol. Always cleans up its temp worktree,
    /// verify branch, and (on success) the feature branch, regardless of
    /// outcome.
    pub fn verify_and_merge(&self, opts: VerifyAndMergeOptions<'_>) -> VerifyAndMergeResult {
        info!(branch = opts.branch_name, "gatekeeper: verifying branch");

        let detected_main = self.detect_main_branch(opts.main_branch);
        let has_origin = self.origin_exists();

        let porcelain = self.porcelain_status();
        let (ignored_dirty, remaining_dirty) = Self::split_dirty(&porcelain);
        if !remaining_dirty.is_empty() {
            return VerifyAndMergeResult::rejected(format!(
                "Main working tree has uncommitted changes; refusing to merge:\n{}",
                remaining_dirty.join("\n")
            ));
        }
        let can_update_ref_without_checkout = !ignored_dirty.is_empty();
        if can_update_ref_without_checkout {
            warn!("main working tree has uncommitted runtime/artifact changes; proceeding, ref update does not touch the working tree");
        }

        if opts.fetch_remote && has_origin {
            let output = self.run_git(&self.project_dir, &["fetch", "origin", &detected_main]);
            if !output.map(|o| o.status.success()).unwrap_or(false) {
                return VerifyAndMergeResult::rejected(format!("Failed to fetch origin/{detected_main}"));
            }
        }

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let temp_worktree_path = self.project_dir.join(format!("verify_temp_{stamp}"));
        let sanitized_branch = opts.branch_name.replace([' ', '\\', ':'], "-");
        let verify_branch = format!("verify/{sanitized_branch}");

        let base_ref = if opts.fetch_remote && has_origin {
            format!("origin/{detected_main}")
        } else {
            detected_main.clone()
        };

        let create_output = self.run_git(
            &self.project_dir,
            &[
                "worktree",
                "add",
                "-b",
                &verify_branch,
                &temp_worktree_path.to_string_lossy(),
                &base_ref,
            ],
        );
        if !create_output.map(|o| o.status.success()).unwrap_or(false) {
            return VerifyAndMergeResult::rejected("Failed to create temporary worktree for verification");
        }
        info!(path = %temp_worktree_path.display(), "created temp verification worktree");

        let result = self.verify_in_worktree(
            &opts,
            &temp_worktree_path,
            &detected_main,
            &verify_branch,
            can_update_ref_without_checkout,
            has_origin,
        );

        self.cleanup(&temp_worktree_path, &verify_branch, opts.agent_id, opts.branch_name, result.approved, opts.delete_feature_branch);

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_in_worktree(
        &self,
        opts: &VerifyAndMergeOptions<'_>,
        temp_worktree_path: &Path,
        detected_main: &str,
        _verify_branch: &str,
        can_update_ref_without_checkout: bool,
        has_origin: bool,
    ) -> VerifyAndMergeResult {
        let merge_output = Command::new("git")
            .args(["merge", "--no-commit", "--no-ff", opts.branch_name])
            .current_dir(temp_worktree_path)
            .output();

        match &merge_output {
            Ok(o) if o.status.success() => {}
            Ok(o) => {
                error!(stderr = %String::from_utf8_lossy(&o.stderr), "merge conflict detected");
                let mut r = VerifyAndMergeResult::rejected("Merge conflict - needs manual resolution");
                r.merge_conflict = true;
                return r;
            }
            Err(e) => {
                return VerifyAndMergeResult::rejected(format!("Merge command failed: {e}"));
            }
        }
        debug!("merged branch in temp worktree (no commit yet)");

        let diff_fingerprint = Self::compute_diff_fingerprint(temp_worktree_path);

        let mut cfg = load_project_config(temp_worktree_path);
        if cfg.preset.is_none() && cfg.commands.is_empty() {
            if let Some(preset) = infer_preset(temp_worktree_path) {
                let cmds = synthesize_commands_from_preset(preset, temp_worktree_path);
                cfg.preset = Some(preset.to_string());
                cfg.commands = cmds;
            }
        }

        let verification = if cfg.commands.is_empty() {
            let test_result = Self::apply_allow_no_tests(
                Self::run_shell("echo 'no verification commands configured' && exit 1", temp_worktree_path, Some(5)),
                opts.allow_no_tests,
            );
            if !test_result.passed {
                let mut r = VerifyAndMergeResult::rejected("No deterministic verification commands configured");
                r.verification = vec![("test".to_string(), test_result)];
                r.diff_fingerprint = diff_fingerprint;
                return r;
            }
            vec![("test".to_string(), test_result)]
        } else {
            match Self::run_ordered_commands(&cfg.commands, temp_worktree_path, opts.allow_no_tests) {
                Ok(v) => v,
                Err((reason, verification)) => {
                    let mut r = VerifyAndMergeResult::rejected(reason);
                    r.verification = verification;
                    r.diff_fingerprint = diff_fingerprint;
                    return r;
                }
            }
        };

        info!("verification passed");

        let review = match self.run_review_gate(&cfg.review, temp_worktree_path) {
            Ok(outcome) => outcome,
            Err((reason, outcome)) => {
                let mut r = VerifyAndMergeResult::rejected(reason);
                r.verification = verification;
                r.diff_fingerprint = diff_fingerprint;
                r.review = outcome;
                return r;
            }
        };

        let commit_output = Command::new("git")
            .args(["commit", "-m", &format!("Merge {}", opts.branch_name)])
            .current_dir(temp_worktree_path)
            .output();
        if !commit_output.map(|o| o.status.success()).unwrap_or(false) {
            let mut r = VerifyAndMergeResult::rejected("Failed to commit merge");
            r.verification = verification;
            r.diff_fingerprint = diff_fingerprint;
            r.review = review;
            return r;
        }

        let merge_commit_hash = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(temp_worktree_path)
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();

        if let Err(e) = self.advance_main(detected_main, &merge_commit_hash, can_update_ref_without_checkout) {
            let mut r = VerifyAndMergeResult::rejected(format!("Failed to advance main: {e}"));
            r.verification = verification;
            r.diff_fingerprint = diff_fingerprint;
            r.merge_commit = Some(merge_commit_hash);
            r.review = review;
            return r;
        }

        let mut push_failed = false;
        if opts.push_remote && has_origin {
            let push_ok = self
                .run_git(&self.project_dir, &["push", "origin", detected_main])
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !push_ok {
                warn!(branch = detected_main, "merged locally but failed to push to origin");
                push_failed = true;
            }
        }

        info!(branch = opts.branch_name, "gatekeeper: approved");

        let mut result = VerifyAndMergeResult {
            approved: true,
            reason: "All tests passed - merged to main".to_string(),
            verification,
            merge_commit: Some(merge_commit_hash),
            diff_fingerprint,
            push_failed,
            merge_conflict: false,
            timestamp: Utc::now(),
            artifact_path: None,
            review,
        };
        self.write_artifact("gatekeeper", opts.feature_id, &mut result);
        result
    }

    fn advance_main(&self, detected_main: &str, merge_commit_hash: &str, can_update_ref_without_checkout: bool) -> anyhow::Result<()> {
        let current_branch = self
            .run_git(&self.project_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();

        if can_update_ref_without_checkout && current_branch != detected_main && current_branch != "HEAD" {
            let output = self.run_git(
                &self.project_dir,
                &["update-ref", &format!("refs/heads/{detected_main}"), merge_commit_hash],
            )?;
            if !output.status.success() {
                anyhow::bail!(String::from_utf8_lossy(&output.stderr).to_string());
            }
            return Ok(());
        }

        self.run_git(&self.project_dir, &["checkout", detected_main])?;
        let merge_result = self.run_git(&self.project_dir, &["merge", "--ff-only", merge_commit_hash])?;
        if current_branch != detected_main && !current_branch.is_empty() {
            let _ = self.run_git(&self.project_dir, &["checkout", &current_branch]);
        }
        if !merge_result.status.success() {
            anyhow::bail!(String::from_utf8_lossy(&merge_result.stderr).to_string());
        }
        Ok(())
    }

    fn cleanup(
        &self,
        temp_worktree_path: &Path,
        verify_branch: &str,
        agent_id: Option<&str>,
        branch_name: &str,
        approved: bool,
        delete_feature_branch: bool,
    ) {
        if temp_worktree_path.exists() {
            let _ = Command::new("git")
                .args(["worktree", "remove", "-f", &temp_worktree_path.to_string_lossy()])
                .current_dir(&self.project_dir)
                .output();
            if temp_worktree_path.exists() {
                let _ = std::fs::remove_dir_all(temp_worktree_path);
            }
        }

        if let Some(agent_id) = agent_id {
            if let Err(e) = self.worktree_manager.delete_worktree(agent_id, true) {
                warn!(agent_id, error = %e, "failed to clean up agent worktree");
            }
        }

        let _ = self
            .run_git(&self.project_dir, &["branch", "-D", verify_branch]);

        if approved && delete_feature_branch {
            let _ = self.run_git(&self.project_dir, &["branch", "-D", branch_name]);
        }
    }

    /// Preflight check: run verification commands in place (no merge),
    /// useful to catch obvious failures before a full temp-worktree pass.
    pub fn verify_commands_only(
        &self,
        worktree_path: Option<&Path>,
        allow_no_tests: bool,
        feature_id: Option<i64>,
    ) -> VerifyAndMergeResult {
        let workdir = worktree_path.unwrap_or(&self.project_dir).to_path_buf();
        let mut cfg = load_project_config(&workdir);
        if cfg.preset.is_none() && cfg.commands.is_empty() {
            if let Some(preset) = infer_preset(&workdir) {
                cfg.commands = synthesize_commands_from_preset(preset, &workdir);
                cfg.preset = Some(preset.to_string());
            }
        }

        if cfg.commands.is_empty() {
            let mut r = VerifyAndMergeResult::rejected("No deterministic verification commands configured");
            self.write_artifact("controller", feature_id, &mut r);
            return r;
        }

        let mut result = match Self::run_ordered_commands(&cfg.commands, &workdir, allow_no_tests) {
            Ok(verification) => VerifyAndMergeResult {
                approved: true,
                reason: "Preflight verification passed".to_string(),
                verification,
                merge_commit: None,
                diff_fingerprint: None,
                push_failed: false,
                merge_conflict: false,
                timestamp: Utc::now(),
                artifact_path: None,
                review: None,
            },
            Err((reason, verification)) => {
                let mut r = VerifyAndMergeResult::rejected(reason);
                r.verification = verification;
                r
            }
        };
        self.write_artifact("controller", feature_id, &mut result);
        result
    }
}

fn which(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(binary);
                candidate.is_file()
            })
        })
        .unwrap_or(false)
}

/// Resolves `{PY}` to a real Python interpreter on `PATH`: `python3` first,
/// then `python`, falling back to the bare name `python3` so the expanded
/// command still fails with a clear "command not found" rather than silently
/// running the orchestrator's own binary.
fn find_python_interpreter() -> String {
    if which("python3") {
        return "python3".to_string();
    }
    if which("python") {
        return "python".to_string();
    }
    "python3".to_string()
}

enum TimeoutOrIoError {
    TimedOut,
    Io(std::io::Error),
}

/// Runs a child process with an optional wall-clock timeout using a
/// watchdog thread, since `std::process::Child` has no native `wait_timeout`.
fn run_with_timeout(mut cmd: Command, timeout: Option<Duration>) -> Result<std::process::Output, TimeoutOrIoError> {
    let Some(timeout) = timeout else {
        return cmd.output().map_err(TimeoutOrIoError::Io);
    };

    let mut child = cmd.spawn().map_err(TimeoutOrIoError::Io)?;
    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                return child.wait_with_output().map_err(TimeoutOrIoError::Io);
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TimeoutOrIoError::TimedOut);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(TimeoutOrIoError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use tempfile::TempDir;

    fn init_repo_with_branch(branch: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let commit_oid = repo
            .commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        let _ = Command::new("git").args(["branch", "-M", "main"]).current_dir(dir.path()).output();

        let commit = repo.find_commit(commit_oid).unwrap();
        repo.branch(branch, &commit, false).unwrap();
        drop(repo);
        dir
    }

    #[test]
    fn detects_main_branch_by_name() {
        let dir = init_repo_with_branch("feat/x");
        let wm = WorktreeManager::new(dir.path(), dir.path().join("worktrees")).unwrap();
        let gk = Gatekeeper::new(dir.path(), wm);
        assert_eq!(gk.detect_main_branch(None), "main");
    }

    #[test]
    fn split_dirty_separates_ignored_paths() {
        let lines = vec![
            "?? .autocoder/state.json".to_string(),
            " M src/main.rs".to_string(),
        ];
        let (ignored, remaining) = Gatekeeper::split_dirty(&lines);
        assert_eq!(ignored.len(), 1);
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn rejects_merge_conflict() {
        let dir = init_repo_with_branch("feat/conflict");
        // diverge main and feat/conflict on the same file to force a conflict.
        Command::new("git").args(["checkout", "feat/conflict"]).current_dir(dir.path()).output().unwrap();
        std::fs::write(dir.path().join("README.md"), "feature change\n").unwrap();
        Command::new("git").args(["commit", "-am", "feature edit"]).current_dir(dir.path()).output().unwrap();
        Command::new("git").args(["checkout", "main"]).current_dir(dir.path()).output().unwrap();
        std::fs::write(dir.path().join("README.md"), "main change\n").unwrap();
        Command::new("git").args(["commit", "-am", "main edit"]).current_dir(dir.path()).output().unwrap();

        let wm = WorktreeManager::new(dir.path(), dir.path().join("worktrees")).unwrap();
        let gk = Gatekeeper::new(dir.path(), wm);
        let result = gk.verify_and_merge(VerifyAndMergeOptions {
            branch_name: "feat/conflict",
            agent_id: None,
            feature_id: None,
            main_branch: Some("main"),
            fetch_remote: false,
            push_remote: false,
            allow_no_tests: true,
            delete_feature_branch: false,
        });
        assert!(!result.approved);
        assert!(result.merge_conflict);
    }
}
