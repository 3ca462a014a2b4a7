use std::path::Path;

use anyhow::{Context, Result};
use git2::{BranchType, Repository, Signature};

#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: String,
    pub message: String,
    pub author: String,
    pub timestamp: i64,
}

/// Thin `git2` wrapper over the operations the WorktreeManager and
/// Gatekeeper need against the main repository or a worktree checkout.
/// Grounded on `my-little-soda/src/git/operations.rs`, trimmed to the
/// operations this engine actually performs (no GitHub remote parsing, no
/// SSH push/fetch credentials — this crate never talks to GitHub).
pub struct GitRepo {
    repo: Repository,
}

impl GitRepo {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let repo = Repository::open(path).context("failed to open git repository")?;
        Ok(Self { repo })
    }

    pub fn inner(&self) -> &Repository {
        &self.repo
    }

    fn signature(&self) -> Result<Signature> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Signature::now("AutoCoder", "autocoder@localhost")
                .context("failed to create default signature"),
        }
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        let branch_ref = self
            .repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("branch '{branch}' not found"))?;

        let reference = branch_ref.get();
        let target = reference.target().context("branch has no target commit")?;
        let commit = self.repo.find_commit(target)?;
        let tree = commit.tree()?;

        self.repo.set_head(reference.name().unwrap())?;
        self.repo.checkout_tree(tree.as_object(), None)?;
        Ok(())
    }

    pub fn create_branch(&self, name: &str, from_ref: &str) -> Result<()> {
        let from_commit = if from_ref == "HEAD" {
            self.repo.head()?.peel_to_commit()?
        } else if let Ok(branch) = self.repo.find_branch(from_ref, BranchType::Local) {
            branch.get().peel_to_commit()?
        } else {
            let obj = self
                .repo
                .revparse_single(from_ref)
                .with_context(|| format!("cannot resolve ref '{from_ref}'"))?;
            obj.peel_to_commit()?
        };

        self.repo
            .branch(name, &from_commit, false)
            .with_context(|| format!("failed to create branch '{name}'"))?;
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.repo.find_branch(branch, BranchType::Local).is_ok()
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let mut b = self
            .repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("branch '{branch}' not found"))?;
        b.delete().context("failed to delete branch")
    }

    pub fn head_branch_name(&self) -> Result<Option<String>> {
        let head = self.repo.head()?;
        Ok(head.shorthand().map(|s| s.to_string()))
    }

    /// `git status --porcelain`-equivalent: paths with any working-tree or
    /// index change, regardless of kind.
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter_map(|entry| entry.path().map(|p| p.to_string()))
            .collect())
    }

    pub fn get_commits(&self, from: Option<&str>, to: Option<&str>) -> Result<Vec<CommitInfo>> {
        let mut revwalk = self.repo.revwalk()?;
        if let Some(to_ref) = to {
            revwalk.push(self.repo.revparse_single(to_ref)?.id())?;
        } else {
            revwalk.push_head()?;
        }
        if let Some(from_ref) = from {
            revwalk.hide(self.repo.revparse_single(from_ref)?.id())?;
        }

        let mut commits = Vec::new();
        for oid in revwalk {
            let oid = oid?;
            let commit = self.repo.find_commit(oid)?;
            commits.push(CommitInfo {
                id: oid.to_string(),
                message: commit.message().unwrap_or("").to_string(),
                author: commit.author().name().unwrap_or("unknown").to_string(),
                timestamp: commit.time().seconds(),
            });
        }
        Ok(commits)
    }

    /// Number of commits on `branch` that are not on `base` (`git rev-list
    /// base..branch --count`).
    pub fn commits_ahead(&self, base: &str, branch: &str) -> Result<usize> {
        let base_oid = self.repo.revparse_single(base)?.id();
        let branch_oid = self.repo.revparse_single(branch)?.id();

        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(branch_oid)?;
        revwalk.hide(base_oid)?;
        Ok(revwalk.count())
    }

    pub fn remote_exists(&self, name: &str) -> bool {
        self.repo.find_remote(name).is_ok()
    }

    pub fn fetch(&self, remote_name: &str, refspec: &str) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote(remote_name)
            .with_context(|| format!("remote '{remote_name}' not found"))?;
        remote
            .fetch(&[refspec], None, None)
            .context("git fetch failed")
    }

    /// `git update-ref refs/heads/<branch> <oid>` without touching the
    /// working tree, used by the Gatekeeper to advance main when it is not
    /// the currently checked-out branch.
    pub fn update_ref(&self, branch: &str, oid: git2::Oid) -> Result<()> {
        let refname = format!("refs/heads/{branch}");
        self.repo
            .reference(&refname, oid, true, "gatekeeper: advance main")
            .map(|_| ())
            .context("failed to update ref")
    }

    pub fn commit_all(&self, message: &str) -> Result<git2::Oid> {
        let signature = self.signature()?;
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let parent = self.repo.head()?.peel_to_commit()?;

        self.repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])
            .context("failed to create commit")
    }

    pub fn rev_parse(&self, spec: &str) -> Result<git2::Oid> {
        Ok(self.repo.revparse_single(spec)?.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_test_repo() -> (TempDir, GitRepo) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        let git = GitRepo::open(dir.path()).unwrap();
        (dir, git)
    }

    #[test]
    fn creates_and_checks_out_branch() {
        let (_dir, git) = init_test_repo();
        git.create_branch("feature/1", "HEAD").unwrap();
        assert!(git.branch_exists("feature/1"));
        git.checkout_branch("feature/1").unwrap();
        assert_eq!(git.head_branch_name().unwrap().as_deref(), Some("feature/1"));
    }

    #[test]
    fn commits_ahead_counts_new_commits() {
        let (dir, git) = init_test_repo();
        git.create_branch("feature/1", "HEAD").unwrap();
        git.checkout_branch("feature/1").unwrap();

        std::fs::write(dir.path().join("new.txt"), "hello").unwrap();
        git.commit_all("add file").unwrap();

        assert_eq!(git.commits_ahead("master", "feature/1").unwrap(), 1);
    }

    #[test]
    fn dirty_paths_reports_untracked_file() {
        let (dir, git) = init_test_repo();
        std::fs::write(dir.path().join("scratch.txt"), "x").unwrap();
        let dirty = git.dirty_paths().unwrap();
        assert!(dirty.iter().any(|p| p == "scratch.txt"));
    }
}
