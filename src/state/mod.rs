//! Persistent workflow state: the durable source of truth for issue and phase progress.
//!
//! The document lives at `.conductor/state.json` and is only mutated through
//! [`StateStore`], which performs load → mutate → save as one unit per call
//! and persists with an atomic rename.

pub mod cleanup;
pub mod criteria;
pub mod rebuild;
pub mod reconcile;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use cleanup::{CleanupAction, CleanupOptions, CleanupReason, CleanupReport, cleanup_stale_entries};
pub use criteria::{
    AcceptanceCriteria, AcceptanceCriterion, CriteriaSummary, CriterionStatus, VerificationMethod,
};
pub use rebuild::rebuild_from_runs;
pub use reconcile::{MergeEvidence, ReconcileReport, reconcile_state_at_startup};
pub use store::StateStore;

/// Schema version written into every state document.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of an issue. Transitions are caller-driven; only
/// reconciliation moves `ReadyForMerge` to `Merged` on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    NotStarted,
    InProgress,
    ReadyForMerge,
    Merged,
    Blocked,
    Abandoned,
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IssueStatus::NotStarted => "not_started",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::ReadyForMerge => "ready_for_merge",
            IssueStatus::Merged => "merged",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Progress of one phase of one issue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseState {
    /// Apply a status transition.
    ///
    /// `started_at` is stamped on the first move to `InProgress` and never
    /// overwritten; `completed_at` is stamped on the first terminal status.
    pub fn transition(&mut self, status: PhaseStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        if status == PhaseStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        match status {
            PhaseStatus::Failed => self.error = error,
            PhaseStatus::Completed => self.error = None,
            _ => {
                if error.is_some() {
                    self.error = error;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityLoopState {
    pub enabled: bool,
    pub max_iterations: u32,
    #[serde(default)]
    pub current_iteration: u32,
}

/// The workflow record for one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueState {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<PrInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<AcceptanceCriteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_loop: Option<QualityLoopState>,
    pub last_activity: DateTime<Utc>,
}

impl IssueState {
    pub fn new(number: u64, title: &str, now: DateTime<Utc>) -> Self {
        Self {
            number,
            title: title.to_string(),
            status: IssueStatus::NotStarted,
            current_phase: None,
            phases: BTreeMap::new(),
            worktree: None,
            branch: None,
            pr: None,
            acceptance_criteria: None,
            quality_loop: None,
            last_activity: now,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseState> {
        self.phases.get(name)
    }
}

/// Optional fields supplied when an issue record is first created.
#[derive(Debug, Clone, Default)]
pub struct IssueInit {
    pub worktree: Option<PathBuf>,
    pub branch: Option<String>,
    pub quality_loop: Option<QualityLoopState>,
}

/// The whole state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub issues: BTreeMap<u64, IssueState>,
}

impl WorkflowState {
    pub fn empty() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            last_updated: Utc::now(),
            issues: BTreeMap::new(),
        }
    }

    pub fn issue(&self, number: u64) -> Option<&IssueState> {
        self.issues.get(&number)
    }

    pub fn issues_with_status(&self, status: IssueStatus) -> Vec<&IssueState> {
        self.issues.values().filter(|i| i.status == status).collect()
    }

    /// Structural checks beyond what deserialization enforces.
    pub(crate) fn validate(&self) -> Result<(), String> {
        for (key, issue) in &self.issues {
            if *key == 0 {
                return Err("issue number 0 is not allowed".to_string());
            }
            if issue.number != *key {
                return Err(format!(
                    "issue keyed as #{} records number #{}",
                    key, issue.number
                ));
            }
            if let Some(ref ac) = issue.acceptance_criteria {
                ac.validate()
                    .map_err(|e| format!("issue #{}: {}", key, e))?;
            }
        }
        Ok(())
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_phase_started_at_is_never_overwritten() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let mut phase = PhaseState::default();

        phase.transition(PhaseStatus::InProgress, None, t0);
        phase.transition(PhaseStatus::Failed, Some("boom".into()), t1);
        phase.transition(PhaseStatus::InProgress, None, t1 + Duration::seconds(5));

        assert_eq!(phase.started_at, Some(t0));
        assert_eq!(phase.completed_at, Some(t1));
        assert_eq!(phase.status, PhaseStatus::InProgress);
        assert_eq!(phase.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_phase_completion_clears_error() {
        let now = Utc::now();
        let mut phase = PhaseState::default();
        phase.transition(PhaseStatus::Failed, Some("exit code 1".into()), now);
        phase.transition(PhaseStatus::Completed, None, now);
        assert!(phase.error.is_none());
        assert_eq!(phase.status, PhaseStatus::Completed);
    }

    #[test]
    fn test_statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&IssueStatus::ReadyForMerge).unwrap(),
            "\"ready_for_merge\""
        );
        assert_eq!(
            serde_json::to_string(&PhaseStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(IssueStatus::NotStarted.to_string(), "not_started");
    }

    #[test]
    fn test_issue_keys_roundtrip_as_strings() {
        let now = Utc::now();
        let mut state = WorkflowState::empty();
        state.issues.insert(42, IssueState::new(42, "Answer", now));

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"42\""));
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.issue(42).unwrap().title, "Answer");
    }

    #[test]
    fn test_validate_rejects_mismatched_key() {
        let now = Utc::now();
        let mut state = WorkflowState::empty();
        state.issues.insert(1, IssueState::new(2, "Wrong", now));
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_issues_with_status() {
        let now = Utc::now();
        let mut state = WorkflowState::empty();
        let mut a = IssueState::new(1, "a", now);
        a.status = IssueStatus::ReadyForMerge;
        state.issues.insert(1, a);
        state.issues.insert(2, IssueState::new(2, "b", now));
        assert_eq!(state.issues_with_status(IssueStatus::ReadyForMerge).len(), 1);
    }
}
