use super::runner::{AgentRunner, PhaseResult};
use crate::conductor_config::ExecutionMode;
use crate::phase::Phase;
use crate::state::QualityLoopState;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Progress notifications emitted while issues execute.
#[derive(Debug, Clone)]
pub enum PhaseEvent {
    IssueStarted { issue: u64 },
    PhaseStarted { issue: u64, phase: String, attempt: u32 },
    PhaseCompleted { issue: u64, result: PhaseResult },
    IssueCompleted { issue: u64, result: IssueResult },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueResult {
    pub issue: u64,
    pub success: bool,
    pub phase_results: Vec<PhaseResult>,
    pub duration_seconds: f64,
}

/// One issue queued for execution.
#[derive(Debug, Clone)]
pub struct IssueJob {
    pub issue: u64,
    pub worktree: Option<PathBuf>,
    /// Per-issue quality loop; falls back to the executor default when None
    pub quality_loop: Option<QualityLoopState>,
}

impl IssueJob {
    pub fn new(issue: u64) -> Self {
        Self {
            issue,
            worktree: None,
            quality_loop: None,
        }
    }
}

/// Retry policy for failing phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityLoop {
    pub enabled: bool,
    pub max_iterations: u32,
    /// Phases eligible for retries
    pub phases: Vec<String>,
}

impl QualityLoop {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_iterations: 1,
            phases: Vec::new(),
        }
    }

    fn attempts_for(&self, job: &IssueJob, phase: &str) -> u32 {
        let (enabled, max) = match job.quality_loop {
            Some(ql) => (ql.enabled, ql.max_iterations),
            None => (self.enabled, self.max_iterations),
        };
        if enabled && self.phases.iter().any(|p| p == phase) {
            max.max(1)
        } else {
            1
        }
    }
}

/// Outcome of a whole batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<IssueResult>,
    /// Issues never started because the batch stopped early
    pub skipped: Vec<u64>,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.skipped.is_empty() && self.results.iter().all(|r| r.success)
    }
}

/// Drives ordered phase chains for issues.
///
/// Cloning is cheap; clones share the cancellation token and event sink.
#[derive(Clone)]
pub struct PhaseExecutor {
    runner: AgentRunner,
    token: CancellationToken,
    dry_run: bool,
    quality_loop: QualityLoop,
    events: Option<mpsc::UnboundedSender<PhaseEvent>>,
}

impl PhaseExecutor {
    pub fn new(runner: AgentRunner, token: CancellationToken) -> Self {
        Self {
            runner,
            token,
            dry_run: false,
            quality_loop: QualityLoop::disabled(),
            events: None,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_quality_loop(mut self, quality_loop: QualityLoop) -> Self {
        self.quality_loop = quality_loop;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PhaseEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: PhaseEvent) {
        if let Some(ref tx) = self.events
            && tx.send(event).is_err()
        {
            tracing::debug!("phase event receiver dropped");
        }
    }

    /// Run `phases` in order for one issue, stopping at the first failure.
    pub async fn execute(&self, job: &IssueJob, phases: &[Phase]) -> IssueResult {
        let start = Instant::now();
        let issue = job.issue;
        self.emit(PhaseEvent::IssueStarted { issue });
        tracing::info!(issue, phases = phases.len(), dry_run = self.dry_run, "starting issue");

        let work_dir = self.runner.work_dir(job.worktree.as_deref());
        let mut phase_results = Vec::new();
        let mut success = true;

        'phases: for phase in phases {
            let max_attempts = self.quality_loop.attempts_for(job, &phase.name);

            for attempt in 1..=max_attempts {
                self.emit(PhaseEvent::PhaseStarted {
                    issue,
                    phase: phase.name.clone(),
                    attempt,
                });

                let result = if self.dry_run {
                    PhaseResult::succeeded(&phase.name, Duration::ZERO, attempt)
                } else {
                    self.runner
                        .run_phase(issue, phase, attempt, &work_dir, &self.token)
                        .await
                };

                self.emit(PhaseEvent::PhaseCompleted {
                    issue,
                    result: result.clone(),
                });

                let retry = !result.success
                    && attempt < max_attempts
                    && result.error.as_ref().is_some_and(|e| e.is_retryable());
                let passed = result.success;
                if !passed {
                    tracing::warn!(
                        issue,
                        phase = %phase.name,
                        attempt,
                        reason = %result.reason().unwrap_or_default(),
                        will_retry = retry,
                        "phase failed"
                    );
                }
                phase_results.push(result);

                if passed {
                    continue 'phases;
                }
                if !retry {
                    success = false;
                    break 'phases;
                }
            }
        }

        let result = IssueResult {
            issue,
            success,
            phase_results,
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        tracing::info!(issue, success, duration_secs = result.duration_seconds, "issue finished");
        self.emit(PhaseEvent::IssueCompleted {
            issue,
            result: result.clone(),
        });
        result
    }

    /// Run a batch of issues under `mode`.
    ///
    /// Sequential stops the queue at the first failed issue. Fan-out never
    /// stops on failure; with `max_parallel > 1` issues run concurrently on
    /// a bounded pool. Cancellation stops dispatching in every mode.
    pub async fn execute_batch(
        &self,
        jobs: Vec<IssueJob>,
        phases: &[Phase],
        mode: ExecutionMode,
        max_parallel: usize,
    ) -> BatchResult {
        match mode {
            ExecutionMode::Sequential => self.run_serial(jobs, phases, true).await,
            ExecutionMode::FanOut if max_parallel <= 1 => self.run_serial(jobs, phases, false).await,
            ExecutionMode::FanOut => self.run_pool(jobs, phases, max_parallel).await,
        }
    }

    async fn run_serial(&self, jobs: Vec<IssueJob>, phases: &[Phase], abort_on_failure: bool) -> BatchResult {
        let mut batch = BatchResult::default();
        let mut queue = jobs.into_iter();

        for job in queue.by_ref() {
            if self.token.is_cancelled() {
                batch.skipped.push(job.issue);
                break;
            }
            let result = self.execute(&job, phases).await;
            let failed = !result.success;
            batch.results.push(result);
            if failed && abort_on_failure {
                tracing::warn!(issue = job.issue, "sequential run stopped after failed issue");
                break;
            }
        }

        batch.skipped.extend(queue.map(|j| j.issue));
        batch
    }

    async fn run_pool(&self, jobs: Vec<IssueJob>, phases: &[Phase], max_parallel: usize) -> BatchResult {
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let phases: Arc<[Phase]> = phases.into();
        let order: Vec<u64> = jobs.iter().map(|j| j.issue).collect();
        let mut join_set: JoinSet<(usize, Option<IssueResult>)> = JoinSet::new();

        tracing::info!(issues = order.len(), max_parallel, "fan-out pool started");

        for (idx, job) in jobs.into_iter().enumerate() {
            let executor = self.clone();
            let phases = Arc::clone(&phases);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit,
                    _ = executor.token.cancelled() => return (idx, None),
                };
                let Ok(_permit) = permit else {
                    return (idx, None);
                };
                if executor.token.is_cancelled() {
                    return (idx, None);
                }
                (idx, Some(executor.execute(&job, &phases).await))
            });
        }

        let mut finished: HashMap<usize, IssueResult> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, Some(result))) => {
                    finished.insert(idx, result);
                }
                Ok((_, None)) => {}
                Err(e) => tracing::warn!(error = %e, "issue task failed to complete"),
            }
        }

        let mut batch = BatchResult::default();
        for (idx, issue) in order.into_iter().enumerate() {
            match finished.remove(&idx) {
                Some(result) => batch.results.push(result),
                None => batch.skipped.push(issue),
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PhaseError;
    use crate::orchestrator::runner::tests::sh_runner;
    use tempfile::tempdir;

    fn phases(names: &[&str]) -> Vec<Phase> {
        names
            .iter()
            .map(|n| Phase::new(n, "{phase}", Duration::from_secs(20)))
            .collect()
    }

    fn jobs(issues: &[u64]) -> Vec<IssueJob> {
        issues.iter().map(|&i| IssueJob::new(i)).collect()
    }

    /// Agent that fails phase `b` and records every invocation.
    fn failing_b(dir: &std::path::Path) -> AgentRunner {
        let log = dir.join("calls.log");
        sh_runner(
            dir,
            &format!(
                "echo \"$2:$1\" >> {}; [ \"$1\" != b ]",
                log.display()
            ),
        )
    }

    fn calls(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[tokio::test]
    async fn test_fail_fast_stops_remaining_phases() {
        let dir = tempdir().unwrap();
        let executor = PhaseExecutor::new(failing_b(dir.path()), CancellationToken::new());

        let result = executor
            .execute(&IssueJob::new(1), &phases(&["a", "b", "c"]))
            .await;

        assert!(!result.success);
        let recorded: Vec<_> = result
            .phase_results
            .iter()
            .map(|r| (r.phase.as_str(), r.success))
            .collect();
        assert_eq!(recorded, vec![("a", true), ("b", false)]);
        assert_eq!(calls(dir.path()), vec!["1:a", "1:b"]);
    }

    #[tokio::test]
    async fn test_dry_run_spawns_nothing() {
        let dir = tempdir().unwrap();
        let runner = AgentRunner::new("/nonexistent/agent", vec![], dir.path());
        let executor = PhaseExecutor::new(runner, CancellationToken::new()).with_dry_run(true);

        let result = executor
            .execute(&IssueJob::new(5), &phases(&["spec", "exec", "qa"]))
            .await;
        assert!(result.success);
        assert_eq!(result.phase_results.len(), 3);
        assert!(result.phase_results.iter().all(|r| r.duration_seconds == 0.0));
    }

    #[tokio::test]
    async fn test_sequential_aborts_queue_on_failure() {
        let dir = tempdir().unwrap();
        let executor = PhaseExecutor::new(failing_b(dir.path()), CancellationToken::new());

        let batch = executor
            .execute_batch(jobs(&[1, 2, 3]), &phases(&["a", "b"]), ExecutionMode::Sequential, 1)
            .await;

        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.skipped, vec![2, 3]);
        assert!(!batch.all_succeeded());
    }

    #[tokio::test]
    async fn test_fan_out_continues_past_failures() {
        let dir = tempdir().unwrap();
        let executor = PhaseExecutor::new(failing_b(dir.path()), CancellationToken::new());

        let batch = executor
            .execute_batch(jobs(&[1, 2, 3]), &phases(&["a", "b"]), ExecutionMode::FanOut, 1)
            .await;

        assert_eq!(batch.results.len(), 3);
        assert!(batch.skipped.is_empty());
        assert!(batch.results.iter().all(|r| !r.success));
        assert_eq!(
            calls(dir.path()),
            vec!["1:a", "1:b", "2:a", "2:b", "3:a", "3:b"]
        );
    }

    #[tokio::test]
    async fn test_pool_keeps_input_order_and_phase_order() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("calls.log");
        // Issue 1 is slow so later issues finish first.
        let runner = sh_runner(
            dir.path(),
            &format!(
                "[ \"$2\" = 1 ] && sleep 0.3; echo \"$2:$1\" >> {}",
                log.display()
            ),
        );
        let executor = PhaseExecutor::new(runner, CancellationToken::new());

        let batch = executor
            .execute_batch(jobs(&[1, 2, 3, 4]), &phases(&["x", "y"]), ExecutionMode::FanOut, 3)
            .await;

        let order: Vec<u64> = batch.results.iter().map(|r| r.issue).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(batch.all_succeeded());

        let calls = calls(dir.path());
        for issue in 1..=4 {
            let x = calls.iter().position(|c| *c == format!("{}:x", issue)).unwrap();
            let y = calls.iter().position(|c| *c == format!("{}:y", issue)).unwrap();
            assert!(x < y);
        }
    }

    #[tokio::test]
    async fn test_quality_loop_retries_nonzero_exit() {
        let dir = tempdir().unwrap();
        let counter = dir.path().join("count");
        // Fails on the first attempt, passes on the second.
        let runner = sh_runner(
            dir.path(),
            &format!(
                "n=$(cat {c} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c}; [ $n -ge 2 ]",
                c = counter.display()
            ),
        );
        let executor = PhaseExecutor::new(runner, CancellationToken::new()).with_quality_loop(QualityLoop {
            enabled: true,
            max_iterations: 3,
            phases: vec!["qa".into()],
        });

        let result = executor.execute(&IssueJob::new(1), &phases(&["qa"])).await;
        assert!(result.success);
        assert_eq!(result.phase_results.len(), 2);
        assert_eq!(result.phase_results[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_quality_loop_never_retries_timeout() {
        let dir = tempdir().unwrap();
        let runner = sh_runner(dir.path(), "sleep 10");
        let executor = PhaseExecutor::new(runner, CancellationToken::new()).with_quality_loop(QualityLoop {
            enabled: true,
            max_iterations: 3,
            phases: vec!["qa".into()],
        });
        let qa = vec![Phase::new("qa", "{phase}", Duration::from_millis(100))];

        let result = executor.execute(&IssueJob::new(1), &qa).await;
        assert_eq!(result.phase_results.len(), 1);
        assert!(matches!(
            result.phase_results[0].error,
            Some(PhaseError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = PhaseExecutor::new(failing_b(dir.path()), CancellationToken::new())
            .with_dry_run(true)
            .with_events(tx);

        executor.execute(&IssueJob::new(9), &phases(&["a"])).await;
        drop(executor);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                PhaseEvent::IssueStarted { .. } => "issue-start",
                PhaseEvent::PhaseStarted { .. } => "phase-start",
                PhaseEvent::PhaseCompleted { .. } => "phase-done",
                PhaseEvent::IssueCompleted { .. } => "issue-done",
            });
        }
        assert_eq!(kinds, vec!["issue-start", "phase-start", "phase-done", "issue-done"]);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_queue() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let executor = PhaseExecutor::new(failing_b(dir.path()), token);

        let batch = executor
            .execute_batch(jobs(&[1, 2]), &phases(&["a"]), ExecutionMode::FanOut, 1)
            .await;
        assert!(batch.results.is_empty());
        assert_eq!(batch.skipped, vec![1, 2]);
    }
}
