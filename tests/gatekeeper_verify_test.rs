//! End-to-end Gatekeeper scenarios against a real temp git repository,
//! mirroring the "Fresh pass" and "No-progress block" scenarios from
//! SPEC_FULL.md §8.

use std::path::Path;
use std::process::Command;

use autocoder::gatekeeper::{Gatekeeper, VerifyAndMergeOptions};
use autocoder::worktree::WorktreeManager;
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git invocation failed");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init"]);
    git(dir.path(), &["config", "user.name", "Test User"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "initial"]);
    git(dir.path(), &["branch", "-M", "main"]);
    dir
}

fn checkout_feature_branch(dir: &Path, branch: &str, file: &str, content: &str) {
    git(dir, &["checkout", "-b", branch]);
    std::fs::write(dir.join(file), content).unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", &format!("add {file}")]);
    git(dir, &["checkout", "main"]);
}

fn gatekeeper_for(dir: &Path) -> Gatekeeper {
    let worktrees = WorktreeManager::new(dir, dir.join("worktrees")).unwrap();
    Gatekeeper::new(dir, worktrees)
}

#[test]
fn fresh_branch_with_passing_command_merges_to_main() {
    let repo = init_repo();
    checkout_feature_branch(repo.path(), "feature/one", "feature.txt", "feature one\n");
    std::fs::write(
        repo.path().join("autocoder.yaml"),
        "commands:\n  test: \"true\"\n",
    )
    .unwrap();
    git(repo.path(), &["add", "autocoder.yaml"]);
    git(repo.path(), &["commit", "-m", "add project config"]);

    let gatekeeper = gatekeeper_for(repo.path());
    let result = gatekeeper.verify_and_merge(VerifyAndMergeOptions {
        branch_name: "feature/one",
        agent_id: None,
        feature_id: Some(1),
        main_branch: Some("main"),
        fetch_remote: false,
        push_remote: false,
        allow_no_tests: false,
        delete_feature_branch: false,
    });

    assert!(result.approved, "expected approval, got: {}", result.reason);
    assert!(result.merge_commit.is_some());
    assert!(!result.merge_conflict);

    let log = Command::new("git")
        .args(["log", "--oneline", "-n", "5", "main"])
        .current_dir(repo.path())
        .output()
        .unwrap();
    let log = String::from_utf8_lossy(&log.stdout);
    assert!(log.contains("Merge feature/one"));
}

#[test]
fn failing_command_is_rejected_and_main_does_not_advance() {
    let repo = init_repo();
    checkout_feature_branch(repo.path(), "feature/broken", "feature.txt", "oops\n");
    std::fs::write(
        repo.path().join("autocoder.yaml"),
        "commands:\n  test: \"exit 1\"\n",
    )
    .unwrap();
    git(repo.path(), &["add", "autocoder.yaml"]);
    git(repo.path(), &["commit", "-m", "add project config"]);

    let before = Command::new("git")
        .args(["rev-parse", "main"])
        .current_dir(repo.path())
        .output()
        .unwrap();
    let before_sha = String::from_utf8_lossy(&before.stdout).trim().to_string();

    let gatekeeper = gatekeeper_for(repo.path());
    let result = gatekeeper.verify_and_merge(VerifyAndMergeOptions {
        branch_name: "feature/broken",
        agent_id: None,
        feature_id: Some(2),
        main_branch: Some("main"),
        fetch_remote: false,
        push_remote: false,
        allow_no_tests: false,
        delete_feature_branch: false,
    });

    assert!(!result.approved);
    assert!(result.merge_commit.is_none());

    let after = Command::new("git")
        .args(["rev-parse", "main"])
        .current_dir(repo.path())
        .output()
        .unwrap();
    let after_sha = String::from_utf8_lossy(&after.stdout).trim().to_string();
    assert_eq!(before_sha, after_sha, "main must not advance on rejection");
}

#[test]
fn no_verification_commands_configured_is_rejected_unless_allow_no_tests() {
    let repo = init_repo();
    checkout_feature_branch(repo.path(), "feature/no-config", "feature.txt", "x\n");

    let gatekeeper = gatekeeper_for(repo.path());
    let result = gatekeeper.verify_and_merge(VerifyAndMergeOptions {
        branch_name: "feature/no-config",
        agent_id: None,
        feature_id: Some(3),
        main_branch: Some("main"),
        fetch_remote: false,
        push_remote: false,
        allow_no_tests: false,
        delete_feature_branch: false,
    });

    assert!(!result.approved);
}

#[test]
fn conflicting_branch_is_rejected_as_merge_conflict() {
    let repo = init_repo();
    checkout_feature_branch(repo.path(), "feature/conflict", "shared.txt", "from feature\n");
    std::fs::write(repo.path().join("shared.txt"), "from main\n").unwrap();
    git(repo.path(), &["add", "shared.txt"]);
    git(repo.path(), &["commit", "-m", "diverge on main"]);

    let gatekeeper = gatekeeper_for(repo.path());
    let result = gatekeeper.verify_and_merge(VerifyAndMergeOptions {
        branch_name: "feature/conflict",
        agent_id: None,
        feature_id: Some(4),
        main_branch: Some("main"),
        fetch_remote: false,
        push_remote: false,
        allow_no_tests: true,
        delete_feature_branch: false,
    });

    assert!(!result.approved);
    assert!(result.merge_conflict);
}
