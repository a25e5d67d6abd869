use super::{IssueState, IssueStatus, StateStore};
use crate::errors::StateError;
use crate::tracker::{IssueTracker, PrState, Probe, VersionControl};
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Report intended changes without writing the document
    pub dry_run: bool,
    /// Remove orphaned entries instead of marking them abandoned
    pub force_remove: bool,
    /// Evict merged/abandoned entries whose last activity is older than this
    pub max_age: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// Orphaned and its PR (or the record itself) is merged
    Merged,
    /// Orphaned and already abandoned
    AlreadyAbandoned,
    /// Orphaned and removal was forced
    Forced,
    /// Merged or abandoned for longer than the age threshold
    Expired,
}

impl std::fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CleanupReason::Merged => "merged",
            CleanupReason::AlreadyAbandoned => "already abandoned",
            CleanupReason::Forced => "forced",
            CleanupReason::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    Removed { issue: u64, reason: CleanupReason },
    MarkedAbandoned { issue: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub actions: Vec<CleanupAction>,
}

impl CleanupReport {
    pub fn removed(&self) -> Vec<u64> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                CleanupAction::Removed { issue, .. } => Some(*issue),
                CleanupAction::MarkedAbandoned { .. } => None,
            })
            .collect()
    }

    pub fn abandoned(&self) -> Vec<u64> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                CleanupAction::MarkedAbandoned { issue } => Some(*issue),
                CleanupAction::Removed { .. } => None,
            })
            .collect()
    }
}

/// Whether a recorded worktree is still among the active ones.
///
/// When worktrees cannot be enumerated, existence on disk is the only signal.
fn worktree_active(path: &Path, active: &Probe<Vec<PathBuf>>) -> bool {
    if !path.exists() {
        return false;
    }
    match active.as_known() {
        Some(list) => {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            list.iter().any(|w| {
                w.canonicalize().unwrap_or_else(|_| w.clone()) == canonical
            })
        }
        None => true,
    }
}

async fn is_merged(issue: &IssueState, tracker: &dyn IssueTracker) -> bool {
    if issue.status == IssueStatus::Merged {
        return true;
    }
    match issue.pr {
        Some(ref pr) => matches!(tracker.pr_state(pr.number).await, Probe::Known(PrState::Merged)),
        None => false,
    }
}

/// Remove or flag entries whose worktree is gone, and evict old finished ones.
pub async fn cleanup_stale_entries(
    store: &mut StateStore,
    tracker: &dyn IssueTracker,
    vcs: &dyn VersionControl,
    options: &CleanupOptions,
) -> Result<CleanupReport, StateError> {
    let snapshot = store.get_state()?.clone();
    let active = vcs.list_worktrees();
    if let Probe::Unavailable(ref reason) = active {
        tracing::debug!(%reason, "worktree list unavailable, using directory existence");
    }

    let now = Utc::now();
    let mut report = CleanupReport {
        dry_run: options.dry_run,
        actions: Vec::new(),
    };

    for issue in snapshot.issues.values() {
        let orphaned = match issue.worktree {
            Some(ref path) => !worktree_active(path, &active),
            None => false,
        };

        if orphaned {
            let action = if is_merged(issue, tracker).await {
                CleanupAction::Removed {
                    issue: issue.number,
                    reason: CleanupReason::Merged,
                }
            } else if issue.status == IssueStatus::Abandoned {
                CleanupAction::Removed {
                    issue: issue.number,
                    reason: CleanupReason::AlreadyAbandoned,
                }
            } else if options.force_remove {
                CleanupAction::Removed {
                    issue: issue.number,
                    reason: CleanupReason::Forced,
                }
            } else {
                CleanupAction::MarkedAbandoned {
                    issue: issue.number,
                }
            };
            report.actions.push(action);
            continue;
        }

        if let Some(max_age) = options.max_age {
            let finished = matches!(issue.status, IssueStatus::Merged | IssueStatus::Abandoned);
            if finished && now - issue.last_activity > max_age {
                report.actions.push(CleanupAction::Removed {
                    issue: issue.number,
                    reason: CleanupReason::Expired,
                });
            }
        }
    }

    for action in &report.actions {
        match action {
            CleanupAction::Removed { issue, reason } => {
                tracing::info!(issue, %reason, dry_run = options.dry_run, "removing state entry");
            }
            CleanupAction::MarkedAbandoned { issue } => {
                tracing::info!(issue, dry_run = options.dry_run, "marking orphaned issue abandoned");
            }
        }
    }

    if options.dry_run || report.actions.is_empty() {
        return Ok(report);
    }

    let mut state = snapshot;
    for action in &report.actions {
        match action {
            CleanupAction::Removed { issue, .. } => {
                state.issues.remove(issue);
            }
            CleanupAction::MarkedAbandoned { issue } => {
                if let Some(record) = state.issues.get_mut(issue) {
                    record.status = IssueStatus::Abandoned;
                    record.last_activity = now;
                }
            }
        }
    }
    store.save_state(state)?;

    Ok(report)
}
