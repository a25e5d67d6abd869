use super::{IssueStatus, StateStore};
use crate::errors::StateError;
use crate::tracker::{IssueTracker, PrState, Probe, VersionControl};
use chrono::Utc;

/// Where the merge evidence for a promoted issue came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEvidence {
    PullRequest,
    BranchAncestry,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Issues that were `ready_for_merge` when the scan began
    pub checked: Vec<u64>,
    pub promoted: Vec<(u64, MergeEvidence)>,
    /// Issues where neither collaborator could answer
    pub unresolved: Vec<u64>,
}

/// Promote `ready_for_merge` issues whose work has verifiably landed.
///
/// The PR state is asked first. Anything other than a known merged PR falls
/// through to branch ancestry against `base_branch`. Collaborator failures
/// count as "not merged yet". The document is only written when something
/// was promoted, so repeated runs without external change are no-ops.
pub async fn reconcile_state_at_startup(
    store: &mut StateStore,
    tracker: &dyn IssueTracker,
    vcs: &dyn VersionControl,
    base_branch: &str,
) -> Result<ReconcileReport, StateError> {
    let candidates: Vec<_> = store
        .get_state()?
        .issues_with_status(IssueStatus::ReadyForMerge)
        .into_iter()
        .map(|issue| (issue.number, issue.pr.as_ref().map(|pr| pr.number), issue.branch.clone()))
        .collect();

    let mut report = ReconcileReport::default();

    for (issue, pr, branch) in candidates {
        report.checked.push(issue);
        let mut any_answer = false;

        if let Some(pr) = pr {
            match tracker.pr_state(pr).await {
                Probe::Known(PrState::Merged) => {
                    report.promoted.push((issue, MergeEvidence::PullRequest));
                    continue;
                }
                Probe::Known(state) => {
                    any_answer = true;
                    tracing::debug!(issue, pr, ?state, "PR not merged, checking branch");
                }
                Probe::Unavailable(reason) => {
                    tracing::debug!(issue, pr, %reason, "PR state unavailable");
                }
            }
        }

        if let Some(ref branch) = branch {
            match vcs.is_branch_merged(branch, base_branch) {
                Probe::Known(true) => {
                    report.promoted.push((issue, MergeEvidence::BranchAncestry));
                    continue;
                }
                Probe::Known(false) => any_answer = true,
                Probe::Unavailable(reason) => {
                    tracing::debug!(issue, %branch, %reason, "branch ancestry unavailable");
                }
            }
        }

        if !any_answer {
            report.unresolved.push(issue);
        }
    }

    if report.promoted.is_empty() {
        return Ok(report);
    }

    let mut state = store.get_state()?.clone();
    let now = Utc::now();
    for (issue, evidence) in &report.promoted {
        if let Some(record) = state.issues.get_mut(issue) {
            tracing::info!(issue, ?evidence, "promoting issue to merged");
            record.status = IssueStatus::Merged;
            record.last_activity = now;
        }
    }
    store.save_state(state)?;

    Ok(report)
}
