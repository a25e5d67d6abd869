//! Issue orchestration: `conductor run`.

use anyhow::{Context, Result};
use futures::FutureExt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use conductor::audit::{RunConfig, RunLogger};
use conductor::conductor_config::ExecutionMode;
use conductor::config::{Config, find_binary};
use conductor::errors::OrchestratorError;
use conductor::orchestrator::{
    AgentRunner, IssueJob, PhaseEvent, PhaseExecutor, QualityLoop, ShutdownCoordinator,
    ShutdownState,
};
use conductor::phase::PhasePlan;
use conductor::state::{
    IssueInit, IssueStatus, PhaseStatus, QualityLoopState, StateStore, reconcile_state_at_startup,
};
use conductor::tracker::{GhCli, GitTracker, IssueInfo, IssueTracker};
use conductor::ui::RunUI;

use crate::Cli;

/// Options for `conductor run`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub issues: Vec<u64>,
    pub phases: Option<String>,
    pub mode: Option<String>,
    pub max_parallel: Option<usize>,
    pub dry_run: bool,
    pub timeout_secs: Option<u64>,
}

/// Flags resolved against `conductor.toml`.
struct RunSettings {
    plan: PhasePlan,
    mode: ExecutionMode,
    max_parallel: usize,
}

fn resolve_settings(args: &RunArgs, config: &Config) -> Result<RunSettings, OrchestratorError> {
    if args.issues.is_empty() {
        return Err(OrchestratorError::EmptyIssueList);
    }
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = args.issues.iter().find(|i| !seen.insert(**i)) {
        return Err(OrchestratorError::InvalidFlag(format!(
            "issue #{} listed more than once",
            dup
        )));
    }

    let names = match args.phases {
        Some(ref list) => PhasePlan::parse_list(list),
        None => config.toml.defaults.phases.clone(),
    };
    let plan = PhasePlan::resolve(
        &names,
        &config.toml,
        args.timeout_secs.map(Duration::from_secs),
    )?;

    let mode = match args.mode {
        Some(ref m) => m.parse()?,
        None => config.toml.defaults.mode,
    };

    let max_parallel = match args.max_parallel {
        Some(0) => {
            return Err(OrchestratorError::InvalidFlag(
                "--max-parallel must be at least 1".to_string(),
            ));
        }
        Some(n) => n,
        None => config.toml.defaults.max_parallel.max(1),
    };

    Ok(RunSettings {
        plan,
        mode,
        max_parallel,
    })
}

/// Persists engine events into the State Store and the Run Log.
struct RunRecorder {
    store: StateStore,
    logger: RunLogger,
    ready_phase: String,
    loop_phases: Vec<String>,
}

impl RunRecorder {
    fn record(&mut self, event: &PhaseEvent) -> Result<()> {
        match event {
            PhaseEvent::IssueStarted { issue } => {
                self.logger.issue_started(*issue)?;
                self.store
                    .update_issue_status(*issue, IssueStatus::InProgress)?;
            }
            PhaseEvent::PhaseStarted {
                issue,
                phase,
                attempt,
            } => {
                self.logger.phase_started(*issue, phase, *attempt)?;
                self.store
                    .update_phase_status(*issue, phase, PhaseStatus::InProgress, None)?;
                if self.loop_phases.iter().any(|p| p == phase) {
                    self.store.update_quality_iteration(*issue, *attempt)?;
                }
            }
            PhaseEvent::PhaseCompleted { issue, result } => {
                let (status, error) = if result.success {
                    (PhaseStatus::Completed, None)
                } else {
                    (
                        PhaseStatus::Failed,
                        result.error.as_ref().map(|e| e.to_string()),
                    )
                };
                self.logger
                    .phase_finished(*issue, &result.phase, status, error.clone())?;
                self.store
                    .update_phase_status(*issue, &result.phase, status, error)?;
            }
            PhaseEvent::IssueCompleted { issue, result } => {
                self.logger.issue_finished(*issue, result.success)?;
                let ready = result
                    .phase_results
                    .iter()
                    .any(|r| r.success && r.phase == self.ready_phase);
                let status = match (result.success, ready) {
                    (false, _) => IssueStatus::Blocked,
                    (true, true) => IssueStatus::ReadyForMerge,
                    (true, false) => IssueStatus::InProgress,
                };
                self.store.update_issue_status(*issue, status)?;
            }
        }
        Ok(())
    }
}

/// Create or refresh the issue records and build the execution queue.
async fn prepare_jobs(
    store: &mut StateStore,
    tracker: &dyn IssueTracker,
    issues: &[u64],
    quality_loop: Option<QualityLoopState>,
) -> Result<Vec<IssueJob>> {
    let mut jobs = Vec::with_capacity(issues.len());
    for &issue in issues {
        let existing = store.get_issue(issue)?;
        let title = match existing {
            Some(ref record) => record.title.clone(),
            None => tracker
                .issue_info(issue)
                .await
                .known()
                .unwrap_or_else(|| IssueInfo::placeholder(issue))
                .title,
        };
        let record = store.initialize_issue(
            issue,
            &title,
            IssueInit {
                quality_loop,
                ..IssueInit::default()
            },
        )?;
        jobs.push(IssueJob {
            issue,
            worktree: record.worktree,
            quality_loop: record.quality_loop,
        });
    }
    Ok(jobs)
}

pub async fn cmd_run(cli: &Cli, config: &Config, args: RunArgs) -> Result<ExitCode> {
    let settings = resolve_settings(&args, config)?;

    // A dry run spawns nothing, so the agent need not be installed.
    if !args.dry_run && find_binary(&config.agent_cmd).is_none() {
        return Err(OrchestratorError::MissingBinary {
            name: config.agent_cmd.clone(),
        }
        .into());
    }
    for warning in config.toml.validate() {
        tracing::warn!(%warning, "configuration warning");
    }

    let ql = &config.toml.quality_loop;
    let quality_loop = QualityLoop {
        enabled: ql.enabled,
        max_iterations: ql.max_iterations,
        phases: ql.phases.clone(),
    };

    let jobs = if args.dry_run {
        args.issues.iter().map(|&i| IssueJob::new(i)).collect()
    } else {
        config.ensure_directories()?;
        let mut store = StateStore::new(&config.state_file);
        let tracker = GhCli::new(&config.project_dir);
        let vcs = GitTracker::new(&config.project_dir);

        let report =
            reconcile_state_at_startup(&mut store, &tracker, &vcs, config.base_branch()).await?;
        for (issue, evidence) in &report.promoted {
            tracing::info!(issue, ?evidence, "issue promoted to merged");
        }

        let issue_loop = ql.enabled.then_some(QualityLoopState {
            enabled: true,
            max_iterations: ql.max_iterations,
            current_iteration: 0,
        });
        prepare_jobs(&mut store, &tracker, &args.issues, issue_loop).await?
    };

    let recorder = if args.dry_run {
        None
    } else {
        let mut logger = RunLogger::new(&config.log_dir);
        let run_id = logger.start_run(RunConfig {
            issues: args.issues.clone(),
            phases: settings.plan.names(),
            mode: settings.mode,
            max_parallel: settings.max_parallel,
            dry_run: args.dry_run,
            verbose: cli.verbose,
            agent_cmd: config.agent_cmd.clone(),
            project_dir: config.project_dir.clone(),
        })?;
        tracing::info!(%run_id, issues = args.issues.len(), "run started");
        Some(Arc::new(Mutex::new(RunRecorder {
            store: StateStore::new(&config.state_file),
            logger,
            ready_phase: config.toml.defaults.ready_phase.clone(),
            loop_phases: quality_loop.phases.clone(),
        })))
    };

    let coordinator = ShutdownCoordinator::new(config.shutdown_timeout());
    coordinator
        .install()
        .context("Failed to install signal handlers")?;
    // Child of the shutdown token, so a persistence failure can stop the
    // batch without starting shutdown.
    let token = coordinator.cancellation_token().child_token();
    let drained = CancellationToken::new();

    if let Some(ref recorder) = recorder {
        let recorder = Arc::clone(recorder);
        coordinator.register_cleanup(
            "finalize-run-log",
            Box::new(move || {
                async move {
                    let path = recorder.lock().await.logger.finish_run()?;
                    tracing::info!(path = %path.display(), "run log written");
                    anyhow::Ok(())
                }
                .boxed()
            }),
        );
    }
    let drain_wait = drained.clone();
    coordinator.register_cleanup(
        "drain-phase-events",
        Box::new(move || {
            async move {
                drain_wait.cancelled().await;
                anyhow::Ok(())
            }
            .boxed()
        }),
    );

    let ui = Arc::new(RunUI::new(
        jobs.len(),
        settings.plan.len(),
        cli.verbose,
    ));
    let (tx, mut rx) = mpsc::unbounded_channel::<PhaseEvent>();
    // Resolves to the first persistence error, if any. After one, the batch
    // is cancelled and later events only reach the UI.
    let consumer = {
        let ui = Arc::clone(&ui);
        let recorder = recorder.clone();
        let drained = drained.clone();
        let stop = token.clone();
        tokio::spawn(async move {
            let mut failure: Option<anyhow::Error> = None;
            while let Some(event) = rx.recv().await {
                ui.handle(&event);
                if failure.is_some() {
                    continue;
                }
                if let Some(ref recorder) = recorder
                    && let Err(e) = recorder.lock().await.record(&event)
                {
                    tracing::error!(error = %e, "failed to persist phase event, stopping run");
                    stop.cancel();
                    failure = Some(e);
                }
            }
            drained.cancel();
            failure
        })
    };

    let runner = AgentRunner::new(
        &config.agent_cmd,
        config.toml.project.agent_args.clone(),
        &config.project_dir,
    )
    .with_kill_grace(config.kill_grace())
    .with_verbose(cli.verbose);
    let executor = PhaseExecutor::new(runner, token)
        .with_dry_run(args.dry_run)
        .with_quality_loop(quality_loop)
        .with_events(tx);

    let batch = executor
        .execute_batch(
            jobs,
            settings.plan.phases(),
            settings.mode,
            settings.max_parallel,
        )
        .await;
    drop(executor);
    let persist_failure = match consumer.await {
        Ok(failure) => failure,
        Err(e) => {
            tracing::warn!(error = %e, "phase event consumer stopped early");
            None
        }
    };

    if coordinator.state() == ShutdownState::ShuttingDown {
        // The coordinator finishes cleanup and exits with the signal's status.
        tracing::info!("run interrupted, waiting for shutdown to complete");
        std::future::pending::<()>().await;
    }

    // Events are drained; a signal from here on only needs the log finalized.
    coordinator.unregister_cleanup("drain-phase-events");

    if let Some(e) = persist_failure {
        if let Some(ref recorder) = recorder
            && let Err(log_err) = recorder.lock().await.logger.finish_run()
        {
            tracing::warn!(error = %log_err, "failed to finalize run log");
        }
        coordinator.dispose();
        ui.finish(&batch, args.dry_run);
        return Err(e.context("Failed to persist workflow state; the run was stopped"));
    }

    if let Some(ref recorder) = recorder {
        let path = recorder.lock().await.logger.finish_run()?;
        tracing::info!(path = %path.display(), "run log written");
    }
    coordinator.dispose();

    ui.finish(&batch, args.dry_run);

    if args.dry_run || batch.all_succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
