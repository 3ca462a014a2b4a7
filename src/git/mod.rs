//! Git operations: a `git2`-backed wrapper used by the WorktreeManager and
//! Gatekeeper for branch/checkout/status/merge plumbing. `git worktree`
//! itself has no `git2` API and is shelled out to directly from
//! `crate::worktree`.

pub mod operations;

pub use operations::{CommitInfo, GitRepo};
