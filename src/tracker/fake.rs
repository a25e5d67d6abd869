//! In-memory collaborators for unit tests.

use super::{ChangedFile, IssueInfo, IssueTracker, PrState, Probe, VersionControl};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

pub(crate) struct FakeVcs {
    pub changed: Probe<Vec<ChangedFile>>,
    pub diff: Probe<String>,
    pub merged_branches: HashMap<String, Probe<bool>>,
    pub worktrees: Probe<Vec<PathBuf>>,
}

impl Default for FakeVcs {
    fn default() -> Self {
        Self {
            changed: Probe::Known(Vec::new()),
            diff: Probe::Known(String::new()),
            merged_branches: HashMap::new(),
            worktrees: Probe::Known(Vec::new()),
        }
    }
}

impl VersionControl for FakeVcs {
    fn merge_base(&self, _base: &str) -> Probe<String> {
        Probe::Known("0000000".to_string())
    }

    fn changed_files(&self, _base: &str) -> Probe<Vec<ChangedFile>> {
        self.changed.clone()
    }

    fn diff_text(&self, _base: &str) -> Probe<String> {
        self.diff.clone()
    }

    fn head_sha(&self) -> Probe<String> {
        Probe::Known("1111111".to_string())
    }

    fn is_branch_merged(&self, branch: &str, _base: &str) -> Probe<bool> {
        self.merged_branches
            .get(branch)
            .cloned()
            .unwrap_or_else(|| Probe::unavailable("unknown branch"))
    }

    fn list_worktrees(&self) -> Probe<Vec<PathBuf>> {
        self.worktrees.clone()
    }
}

#[derive(Default)]
pub(crate) struct FakeTracker {
    pub prs: HashMap<u64, Probe<PrState>>,
    pub titles: HashMap<u64, String>,
}

#[async_trait]
impl IssueTracker for FakeTracker {
    async fn issue_info(&self, issue: u64) -> Probe<IssueInfo> {
        match self.titles.get(&issue) {
            Some(title) => Probe::Known(IssueInfo {
                title: title.clone(),
                labels: Vec::new(),
            }),
            None => Probe::unavailable("no such issue"),
        }
    }

    async fn pr_state(&self, pr_number: u64) -> Probe<PrState> {
        self.prs
            .get(&pr_number)
            .cloned()
            .unwrap_or_else(|| Probe::unavailable("gh unavailable"))
    }
}
