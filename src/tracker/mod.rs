//! Read-only collaborators: version control and the issue tracker.
//!
//! Every query returns a [`Probe`] instead of an error. A failed `git` or
//! `gh` call is "no information", never a reason to abort a run, but callers
//! still need to tell "checked and false" apart from "could not check".

#[cfg(test)]
pub(crate) mod fake;
pub mod git;
pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use git::GitTracker;
pub use github::GhCli;

/// Outcome of a best-effort collaborator query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Known(T),
    Unavailable(String),
}

impl<T> Probe<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Probe::Unavailable(reason.into())
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Probe::Known(_))
    }

    pub fn known(self) -> Option<T> {
        match self {
            Probe::Known(v) => Some(v),
            Probe::Unavailable(_) => None,
        }
    }

    pub fn as_known(&self) -> Option<&T> {
        match self {
            Probe::Known(v) => Some(v),
            Probe::Unavailable(_) => None,
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        self.known().unwrap_or(default)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Probe<U> {
        match self {
            Probe::Known(v) => Probe::Known(f(v)),
            Probe::Unavailable(reason) => Probe::Unavailable(reason),
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for Probe<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Probe::Known(v),
            Err(e) => Probe::Unavailable(e.to_string()),
        }
    }
}

/// How a file differs from the merge-base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One entry of the changed-file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    /// Repository-relative path with `/` separators
    pub path: String,
    pub status: FileStatus,
    pub lines_added: usize,
    pub lines_deleted: usize,
    /// Content hash of this file's patch
    pub fingerprint: String,
}

/// Version-control queries the conductor relies on.
pub trait VersionControl: Send + Sync {
    /// Merge-base commit between HEAD and `base`.
    fn merge_base(&self, base: &str) -> Probe<String>;

    /// Files changed in the working tree relative to the merge-base with `base`.
    fn changed_files(&self, base: &str) -> Probe<Vec<ChangedFile>>;

    /// Unified diff of the working tree relative to the merge-base with `base`.
    fn diff_text(&self, base: &str) -> Probe<String>;

    fn head_sha(&self) -> Probe<String>;

    /// Whether `branch` is fully contained in `base`.
    fn is_branch_merged(&self, branch: &str, base: &str) -> Probe<bool>;

    /// Directories of every worktree attached to the repository.
    fn list_worktrees(&self) -> Probe<Vec<PathBuf>>;
}

/// Merge state of a pull request as reported by the issue tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Merged,
    Closed,
    Open,
    Unknown,
}

impl PrState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "MERGED" => PrState::Merged,
            "CLOSED" => PrState::Closed,
            "OPEN" => PrState::Open,
            _ => PrState::Unknown,
        }
    }
}

/// Issue metadata used when a record is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInfo {
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl IssueInfo {
    pub fn placeholder(issue: u64) -> Self {
        Self {
            title: format!("Issue #{}", issue),
            labels: Vec::new(),
        }
    }
}

/// Issue-tracker queries the conductor relies on.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn issue_info(&self, issue: u64) -> Probe<IssueInfo>;

    async fn pr_state(&self, pr_number: u64) -> Probe<PrState>;
}
