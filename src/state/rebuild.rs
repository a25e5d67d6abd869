use super::{IssueState, IssueStatus, PhaseState, PhaseStatus, WorkflowState};
use crate::audit::RunLog;
use crate::tracker::IssueInfo;
use chrono::Utc;

/// Reconstruct a workflow state from finished Run Logs.
///
/// Runs are replayed oldest first, so later runs overwrite earlier phase
/// records. Every issue seen comes back as `in_progress` with a
/// placeholder title; callers refine titles through the issue tracker.
pub fn rebuild_from_runs(runs: &[RunLog]) -> WorkflowState {
    let mut ordered: Vec<&RunLog> = runs.iter().collect();
    ordered.sort_by_key(|r| r.started_at);

    let mut state = WorkflowState::empty();

    for run in ordered {
        for log in &run.issues {
            let record = state.issues.entry(log.issue).or_insert_with(|| {
                IssueState::new(log.issue, &IssueInfo::placeholder(log.issue).title, log.started_at)
            });
            record.status = IssueStatus::InProgress;

            for entry in &log.phases {
                let phase = record
                    .phases
                    .entry(entry.phase.clone())
                    .or_insert_with(PhaseState::default);
                phase.status = match entry.status {
                    // An entry left open means the run was interrupted.
                    PhaseStatus::InProgress if entry.ended_at.is_none() => PhaseStatus::Failed,
                    status => status,
                };
                if phase.started_at.is_none() {
                    phase.started_at = Some(entry.started_at);
                }
                phase.completed_at = entry.ended_at;
                phase.error = match phase.status {
                    PhaseStatus::Failed => entry
                        .error
                        .clone()
                        .or_else(|| Some("interrupted".to_string())),
                    _ => None,
                };
                record.current_phase = Some(entry.phase.clone());
            }

            let last_seen = log
                .ended_at
                .or_else(|| log.phases.iter().filter_map(|p| p.ended_at).max())
                .unwrap_or(log.started_at);
            if last_seen > record.last_activity {
                record.last_activity = last_seen;
            }
        }
    }

    state.last_updated = Utc::now();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{IssueLog, PhaseLog, RunConfig};
    use crate::conductor_config::ExecutionMode;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;

    fn run_at(hour: u32, issues: Vec<IssueLog>) -> RunLog {
        let mut run = RunLog::new(RunConfig {
            issues: issues.iter().map(|i| i.issue).collect(),
            phases: vec!["spec".into(), "exec".into()],
            mode: ExecutionMode::Sequential,
            max_parallel: 1,
            dry_run: false,
            verbose: false,
            agent_cmd: "claude".into(),
            project_dir: PathBuf::from("."),
        });
        run.started_at = Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap();
        run.issues = issues;
        run
    }

    fn issue_log(issue: u64, phases: Vec<(&str, PhaseStatus, Option<&str>)>) -> IssueLog {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        IssueLog {
            issue,
            started_at: start,
            ended_at: Some(start + Duration::minutes(10)),
            success: None,
            phases: phases
                .into_iter()
                .map(|(name, status, error)| {
                    let mut p = PhaseLog::new(name, 1);
                    p.started_at = start;
                    p.status = status;
                    p.ended_at = (status != PhaseStatus::InProgress)
                        .then_some(start + Duration::minutes(5));
                    p.error = error.map(String::from);
                    p
                })
                .collect(),
        }
    }

    #[test]
    fn test_later_runs_win() {
        let older = run_at(
            1,
            vec![issue_log(
                7,
                vec![
                    ("spec", PhaseStatus::Completed, None),
                    ("exec", PhaseStatus::Failed, Some("exit code 1")),
                ],
            )],
        );
        let newer = run_at(2, vec![issue_log(7, vec![("exec", PhaseStatus::Completed, None)])]);

        // Input order must not matter.
        let state = rebuild_from_runs(&[newer, older]);
        let issue = state.issue(7).unwrap();
        assert_eq!(issue.title, "Issue #7");
        assert_eq!(issue.status, IssueStatus::InProgress);
        assert_eq!(issue.phases["spec"].status, PhaseStatus::Completed);
        assert_eq!(issue.phases["exec"].status, PhaseStatus::Completed);
        assert!(issue.phases["exec"].error.is_none());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_open_entry_becomes_interrupted_failure() {
        let run = run_at(1, vec![issue_log(3, vec![("qa", PhaseStatus::InProgress, None)])]);
        let state = rebuild_from_runs(&[run]);
        let qa = &state.issue(3).unwrap().phases["qa"];
        assert_eq!(qa.status, PhaseStatus::Failed);
        assert_eq!(qa.error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_no_runs_is_empty_state() {
        assert!(rebuild_from_runs(&[]).issues.is_empty());
    }
}
