use super::{
    AcceptanceCriteria, CriterionStatus, IssueInit, IssueState, IssueStatus, PhaseStatus, PrInfo,
    STATE_SCHEMA_VERSION, WorkflowState,
};
use crate::errors::StateError;
use crate::util::atomic_write;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Exclusive accessor for the workflow state document.
///
/// The state is cached after the first load. Every mutation helper runs
/// load → mutate → save as one unit, so callers never hold a stale copy
/// across a write.
pub struct StateStore {
    path: PathBuf,
    cached: Option<WorkflowState>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state, loading it from disk on first access.
    pub fn get_state(&mut self) -> Result<&WorkflowState, StateError> {
        let state = match self.cached.take() {
            Some(state) => state,
            None => self.load()?,
        };
        Ok(self.cached.insert(state))
    }

    /// Read and validate the document from disk without touching the cache.
    ///
    /// A missing file is an empty state. Anything unparsable, of another
    /// schema version, or structurally inconsistent is an error: the store
    /// never replaces a document it cannot read.
    pub fn load(&self) -> Result<WorkflowState, StateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no state document, starting empty");
                return Ok(WorkflowState::empty());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        let found = raw
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StateError::Invalid {
                path: self.path.clone(),
                message: "missing numeric 'version' field".to_string(),
            })?;
        if found != u64::from(STATE_SCHEMA_VERSION) {
            return Err(StateError::SchemaMismatch {
                path: self.path.clone(),
                found: u32::try_from(found).unwrap_or(u32::MAX),
                expected: STATE_SCHEMA_VERSION,
            });
        }

        let state: WorkflowState =
            serde_json::from_value(raw).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        state.validate().map_err(|message| StateError::Invalid {
            path: self.path.clone(),
            message,
        })?;

        Ok(state)
    }

    /// Stamp `last_updated` and persist atomically.
    pub fn save_state(&mut self, mut state: WorkflowState) -> Result<(), StateError> {
        state.version = STATE_SCHEMA_VERSION;
        state.last_updated = Utc::now();

        let json = serde_json::to_string_pretty(&state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        atomic_write(&self.path, json.as_bytes()).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;

        self.cached = Some(state);
        Ok(())
    }

    pub fn get_issue(&mut self, issue: u64) -> Result<Option<IssueState>, StateError> {
        Ok(self.get_state()?.issue(issue).cloned())
    }

    fn mutate<T>(
        &mut self,
        f: impl FnOnce(&mut WorkflowState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut state = self.get_state()?.clone();
        let out = f(&mut state)?;
        self.save_state(state)?;
        Ok(out)
    }

    fn mutate_issue<T>(
        &mut self,
        issue: u64,
        f: impl FnOnce(&mut IssueState) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        self.mutate(|state| {
            let record = state
                .issues
                .get_mut(&issue)
                .ok_or(StateError::IssueNotFound { issue })?;
            let out = f(record)?;
            record.last_activity = Utc::now();
            Ok(out)
        })
    }

    /// Create the record for `issue` if it does not exist yet.
    ///
    /// An existing record is returned unchanged apart from filling in a
    /// worktree or branch it did not have.
    pub fn initialize_issue(
        &mut self,
        issue: u64,
        title: &str,
        init: IssueInit,
    ) -> Result<IssueState, StateError> {
        self.mutate(|state| {
            let now = Utc::now();
            let record = state
                .issues
                .entry(issue)
                .or_insert_with(|| {
                    tracing::debug!(issue, "initializing issue record");
                    let mut record = IssueState::new(issue, title, now);
                    record.quality_loop = init.quality_loop;
                    record
                });
            if record.worktree.is_none() {
                record.worktree = init.worktree;
            }
            if record.branch.is_none() {
                record.branch = init.branch;
            }
            Ok(record.clone())
        })
    }

    /// Record a phase transition. Moving to `InProgress` also sets the
    /// issue's current phase.
    pub fn update_phase_status(
        &mut self,
        issue: u64,
        phase: &str,
        status: PhaseStatus,
        error: Option<String>,
    ) -> Result<(), StateError> {
        self.mutate_issue(issue, |record| {
            let now = Utc::now();
            record
                .phases
                .entry(phase.to_string())
                .or_default()
                .transition(status, error, now);
            if status == PhaseStatus::InProgress {
                record.current_phase = Some(phase.to_string());
            }
            Ok(())
        })
    }

    pub fn update_issue_status(&mut self, issue: u64, status: IssueStatus) -> Result<(), StateError> {
        self.mutate_issue(issue, |record| {
            tracing::debug!(issue, from = %record.status, to = %status, "issue status change");
            record.status = status;
            Ok(())
        })
    }

    pub fn update_pr_info(&mut self, issue: u64, pr: PrInfo) -> Result<(), StateError> {
        self.mutate_issue(issue, |record| {
            record.pr = Some(pr);
            Ok(())
        })
    }

    pub fn update_acceptance_criteria(
        &mut self,
        issue: u64,
        criteria: AcceptanceCriteria,
    ) -> Result<(), StateError> {
        criteria.validate().map_err(|message| StateError::Invalid {
            path: self.path.clone(),
            message: format!("issue #{}: {}", issue, message),
        })?;
        self.mutate_issue(issue, |record| {
            record.acceptance_criteria = Some(criteria);
            Ok(())
        })
    }

    pub fn update_ac_status(
        &mut self,
        issue: u64,
        id: &str,
        status: CriterionStatus,
        notes: Option<String>,
    ) -> Result<(), StateError> {
        self.mutate_issue(issue, |record| {
            let not_found = || StateError::CriterionNotFound {
                issue,
                id: id.to_string(),
            };
            let criteria = record.acceptance_criteria.as_mut().ok_or_else(not_found)?;
            if criteria.update_status(id, status, notes, Utc::now()) {
                Ok(())
            } else {
                Err(not_found())
            }
        })
    }

    /// Persist the quality-loop attempt counter for an issue.
    pub fn update_quality_iteration(&mut self, issue: u64, iteration: u32) -> Result<(), StateError> {
        self.mutate_issue(issue, |record| {
            if let Some(ref mut ql) = record.quality_loop {
                ql.current_iteration = iteration;
            }
            Ok(())
        })
    }

    /// Remove an issue record. Returns whether it existed.
    pub fn remove_issue(&mut self, issue: u64) -> Result<bool, StateError> {
        self.mutate(|state| Ok(state.issues.remove(&issue).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AcceptanceCriterion, QualityLoopState, VerificationMethod};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> StateStore {
        StateStore::new(dir.join(".conductor/state.json"))
    }

    #[test]
    fn test_missing_document_is_empty_state() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        let state = store.get_state().unwrap();
        assert_eq!(state.version, STATE_SCHEMA_VERSION);
        assert!(state.issues.is_empty());
    }

    #[test]
    fn test_corrupt_document_is_fatal_and_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut store = StateStore::new(&path);
        assert!(matches!(store.get_state(), Err(StateError::Corrupt { .. })));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "last_updated": "2024-01-01T00:00:00Z", "issues": {}}"#)
            .unwrap();

        let store = StateStore::new(&path);
        match store.load() {
            Err(StateError::SchemaMismatch { found, expected, .. }) => {
                assert_eq!(found, 99);
                assert_eq!(expected, STATE_SCHEMA_VERSION);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_field_type_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"version": 1, "last_updated": "2024-01-01T00:00:00Z", "issues": {"3": {"number": "three"}}}"#,
        )
        .unwrap();
        assert!(StateStore::new(&path).load().is_err());
    }

    #[test]
    fn test_mutating_unknown_issue_is_not_found() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        let err = store
            .update_issue_status(404, IssueStatus::Blocked)
            .unwrap_err();
        assert!(matches!(err, StateError::IssueNotFound { issue: 404 }));
        assert!(err.to_string().contains("#404"));
    }

    #[test]
    fn test_initialize_and_phase_lifecycle_persist() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store
            .initialize_issue(
                7,
                "Add login",
                IssueInit {
                    branch: Some("feature/7".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_phase_status(7, "spec", PhaseStatus::InProgress, None)
            .unwrap();
        store
            .update_phase_status(7, "spec", PhaseStatus::Completed, None)
            .unwrap();
        store
            .update_phase_status(7, "exec", PhaseStatus::InProgress, None)
            .unwrap();
        store
            .update_phase_status(7, "exec", PhaseStatus::Failed, Some("exit code 2".into()))
            .unwrap();

        let mut reopened = store_in(dir.path());
        let issue = reopened.get_issue(7).unwrap().unwrap();
        assert_eq!(issue.title, "Add login");
        assert_eq!(issue.branch.as_deref(), Some("feature/7"));
        assert_eq!(issue.current_phase.as_deref(), Some("exec"));
        assert_eq!(issue.phase("spec").unwrap().status, PhaseStatus::Completed);
        let exec = issue.phase("exec").unwrap();
        assert_eq!(exec.status, PhaseStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("exit code 2"));
        assert!(exec.started_at.is_some());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.initialize_issue(1, "First", IssueInit::default()).unwrap();
        store.update_issue_status(1, IssueStatus::InProgress).unwrap();
        let again = store
            .initialize_issue(1, "Renamed", IssueInit::default())
            .unwrap();
        assert_eq!(again.title, "First");
        assert_eq!(again.status, IssueStatus::InProgress);
    }

    #[test]
    fn test_started_at_survives_later_updates() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.initialize_issue(2, "x", IssueInit::default()).unwrap();
        store
            .update_phase_status(2, "qa", PhaseStatus::InProgress, None)
            .unwrap();
        let first = store.get_issue(2).unwrap().unwrap().phases["qa"].started_at;

        store
            .update_phase_status(2, "qa", PhaseStatus::Failed, Some("t".into()))
            .unwrap();
        store
            .update_phase_status(2, "qa", PhaseStatus::InProgress, None)
            .unwrap();
        let later = store.get_issue(2).unwrap().unwrap().phases["qa"].started_at;
        assert_eq!(first, later);
    }

    #[test]
    fn test_acceptance_criteria_helpers() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store.initialize_issue(5, "AC", IssueInit::default()).unwrap();
        store
            .update_acceptance_criteria(
                5,
                AcceptanceCriteria::new(vec![AcceptanceCriterion::new(
                    "AC-1",
                    "Works",
                    VerificationMethod::UnitTest,
                )]),
            )
            .unwrap();
        store
            .update_ac_status(5, "AC-1", CriterionStatus::Met, Some("green".into()))
            .unwrap();

        let issue = store.get_issue(5).unwrap().unwrap();
        let ac = issue.acceptance_criteria.unwrap();
        assert_eq!(ac.summary().met, 1);
        assert!(ac.get("AC-1").unwrap().verified_at.is_some());

        let err = store
            .update_ac_status(5, "AC-2", CriterionStatus::Met, None)
            .unwrap_err();
        assert!(matches!(err, StateError::CriterionNotFound { .. }));
    }

    #[test]
    fn test_pr_info_quality_iteration_and_remove() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        store
            .initialize_issue(
                9,
                "PR",
                IssueInit {
                    quality_loop: Some(QualityLoopState {
                        enabled: true,
                        max_iterations: 3,
                        current_iteration: 0,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_pr_info(
                9,
                PrInfo {
                    number: 31,
                    url: "https://example.test/pr/31".into(),
                },
            )
            .unwrap();
        store.update_quality_iteration(9, 2).unwrap();

        let issue = store.get_issue(9).unwrap().unwrap();
        assert_eq!(issue.pr.unwrap().number, 31);
        assert_eq!(issue.quality_loop.unwrap().current_iteration, 2);

        assert!(store.remove_issue(9).unwrap());
        assert!(!store.remove_issue(9).unwrap());
    }

    #[test]
    fn test_save_stamps_last_updated() {
        let dir = tempdir().unwrap();
        let mut store = store_in(dir.path());
        let mut state = WorkflowState::empty();
        state.last_updated = chrono::DateTime::from_timestamp(0, 0).unwrap();
        store.save_state(state).unwrap();
        assert!(store.load().unwrap().last_updated.timestamp() > 0);
    }

    #[test]
    fn test_concurrent_saves_never_leave_partial_document() {
        let dir = tempdir().unwrap();
        let path = Arc::new(dir.path().join("state.json"));
        StateStore::new(path.as_path())
            .save_state(WorkflowState::empty())
            .unwrap();

        let writers: Vec<_> = (1..=8u64)
            .map(|n| {
                let path = Arc::clone(&path);
                std::thread::spawn(move || {
                    for i in 0..20u64 {
                        let mut state = WorkflowState::empty();
                        for k in 1..=n * 5 {
                            state
                                .issues
                                .insert(k, IssueState::new(k, &format!("issue {} {}", k, i), Utc::now()));
                        }
                        StateStore::new(path.as_path()).save_state(state).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let path = Arc::clone(&path);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    StateStore::new(path.as_path()).load().unwrap();
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        StateStore::new(path.as_path()).load().unwrap();
    }
}
