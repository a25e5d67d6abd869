//! Run Log: one append-only record per `conductor run` invocation.
//!
//! A run's log is kept as `current-run.json` while it is in progress and
//! written to `runs/<timestamp>_<id8>.json` when it finishes. Finished logs
//! are never rewritten; they are the input for state reconstruction.

pub mod logger;

use crate::conductor_config::ExecutionMode;
use crate::state::PhaseStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub use logger::RunLogger;

/// Error recorded on timeline entries a run never closed.
pub const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    #[serde(default)]
    pub issues: Vec<IssueLog>,
}

impl RunLog {
    pub fn new(config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            config,
            issues: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Close every open issue and phase entry as a failure.
    pub fn mark_interrupted(&mut self) {
        let now = Utc::now();
        for issue in &mut self.issues {
            for phase in issue.phases.iter_mut().filter(|p| p.ended_at.is_none()) {
                phase.finish(PhaseStatus::Failed, Some(INTERRUPTED.to_string()));
            }
            if issue.ended_at.is_none() {
                issue.ended_at = Some(now);
                issue.success = Some(false);
            }
        }
        if self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
    }

    pub fn issue(&self, issue: u64) -> Option<&IssueLog> {
        self.issues.iter().find(|i| i.issue == issue)
    }

    fn issue_mut(&mut self, issue: u64) -> &mut IssueLog {
        let idx = match self.issues.iter().position(|i| i.issue == issue) {
            Some(idx) => idx,
            None => {
                self.issues.push(IssueLog::new(issue));
                self.issues.len() - 1
            }
        };
        &mut self.issues[idx]
    }
}

/// Snapshot of the options a run was started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub issues: Vec<u64>,
    pub phases: Vec<String>,
    pub mode: ExecutionMode,
    #[serde(default = "default_parallel")]
    pub max_parallel: usize,
    pub dry_run: bool,
    pub verbose: bool,
    pub agent_cmd: String,
    pub project_dir: PathBuf,
}

fn default_parallel() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLog {
    pub issue: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// None while the issue is still running
    pub success: Option<bool>,
    #[serde(default)]
    pub phases: Vec<PhaseLog>,
}

impl IssueLog {
    fn new(issue: u64) -> Self {
        Self {
            issue,
            started_at: Utc::now(),
            ended_at: None,
            success: None,
            phases: Vec::new(),
        }
    }

    /// Latest timeline entry for `phase`.
    pub fn last_phase(&self, phase: &str) -> Option<&PhaseLog> {
        self.phases.iter().rev().find(|p| p.phase == phase)
    }
}

/// One entry of an issue's phase timeline. A retried phase gets one entry
/// per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseLog {
    pub phase: String,
    pub status: PhaseStatus,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_attempt() -> u32 {
    1
}

impl PhaseLog {
    pub fn new(phase: &str, attempt: u32) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::InProgress,
            attempt,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    pub fn finish(&mut self, status: PhaseStatus, error: Option<String>) {
        self.ended_at = Some(Utc::now());
        self.status = status;
        self.error = error;
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}
