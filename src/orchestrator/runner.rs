use crate::errors::PhaseError;
use crate::phase::Phase;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Outcome of one phase attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub phase: String,
    pub success: bool,
    pub duration_seconds: f64,
    /// 1-based attempt number; above 1 only under a quality loop
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_error")]
    pub error: Option<PhaseError>,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<PhaseError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_str(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl PhaseResult {
    pub fn succeeded(phase: &str, duration: Duration, attempt: u32) -> Self {
        Self {
            phase: phase.to_string(),
            success: true,
            duration_seconds: duration.as_secs_f64(),
            attempt,
            exit_code: Some(0),
            error: None,
        }
    }

    pub fn failed(phase: &str, duration: Duration, attempt: u32, error: PhaseError) -> Self {
        let exit_code = match error {
            PhaseError::NonZeroExit { exit_code, .. } => Some(exit_code),
            _ => None,
        };
        Self {
            phase: phase.to_string(),
            success: false,
            duration_seconds: duration.as_secs_f64(),
            attempt,
            exit_code,
            error: Some(error),
        }
    }

    /// Short failure reason ("timeout", "exit code 2", ...).
    pub fn reason(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.reason())
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawns the external agent for one phase and supervises it.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    agent_cmd: String,
    agent_args: Vec<String>,
    project_dir: PathBuf,
    kill_grace: Duration,
    verbose: bool,
}

impl AgentRunner {
    pub fn new(agent_cmd: &str, agent_args: Vec<String>, project_dir: &Path) -> Self {
        Self {
            agent_cmd: agent_cmd.to_string(),
            agent_args,
            project_dir: project_dir.to_path_buf(),
            kill_grace: Duration::from_secs(5),
            verbose: false,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn agent_cmd(&self) -> &str {
        &self.agent_cmd
    }

    /// The issue's worktree when it still exists, otherwise the project directory.
    pub fn work_dir(&self, worktree: Option<&Path>) -> PathBuf {
        match worktree {
            Some(path) if path.is_dir() => path.to_path_buf(),
            _ => self.project_dir.clone(),
        }
    }

    /// Run `phase` for `issue` until exit, timeout or cancellation.
    ///
    /// Never returns an error: spawn failures, timeouts and cancellation are
    /// all reported as a failed `PhaseResult`.
    pub async fn run_phase(
        &self,
        issue: u64,
        phase: &Phase,
        attempt: u32,
        work_dir: &Path,
        token: &CancellationToken,
    ) -> PhaseResult {
        let start = Instant::now();
        let directive = phase.render_directive(issue);

        if token.is_cancelled() {
            return PhaseResult::failed(
                &phase.name,
                start.elapsed(),
                attempt,
                PhaseError::Cancelled {
                    issue,
                    phase: phase.name.clone(),
                },
            );
        }

        let mut cmd = Command::new(&self.agent_cmd);
        cmd.args(&self.agent_args)
            .arg(&directive)
            .arg(issue.to_string())
            .current_dir(work_dir)
            .env("CONDUCTOR_PHASE", &phase.name)
            .env("CONDUCTOR_ISSUE", issue.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Own process group, so termination reaches whatever the agent spawns.
        #[cfg(unix)]
        cmd.process_group(0);
        if self.verbose {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(issue, phase = %phase.name, cmd = %self.agent_cmd, error = %e, "agent spawn failed");
                return PhaseResult::failed(
                    &phase.name,
                    start.elapsed(),
                    attempt,
                    PhaseError::SpawnFailed {
                        issue,
                        phase: phase.name.clone(),
                        message: e.to_string(),
                    },
                );
            }
        };

        tracing::debug!(
            issue,
            phase = %phase.name,
            pid = child.id().unwrap_or(0),
            %directive,
            timeout_secs = phase.timeout.as_secs(),
            "agent spawned"
        );

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(phase.timeout) => Outcome::TimedOut,
            _ = token.cancelled() => Outcome::Cancelled,
        };

        let result = match outcome {
            Outcome::Exited(Ok(status)) if status.success() => {
                PhaseResult::succeeded(&phase.name, start.elapsed(), attempt)
            }
            Outcome::Exited(Ok(status)) => PhaseResult::failed(
                &phase.name,
                start.elapsed(),
                attempt,
                PhaseError::NonZeroExit {
                    issue,
                    phase: phase.name.clone(),
                    exit_code: exit_code_of(status),
                },
            ),
            Outcome::Exited(Err(e)) => PhaseResult::failed(
                &phase.name,
                start.elapsed(),
                attempt,
                PhaseError::SpawnFailed {
                    issue,
                    phase: phase.name.clone(),
                    message: format!("failed waiting for agent: {}", e),
                },
            ),
            Outcome::TimedOut => {
                tracing::warn!(issue, phase = %phase.name, timeout_secs = phase.timeout.as_secs(), "phase timed out");
                self.terminate(&mut child, issue, &phase.name).await;
                PhaseResult::failed(
                    &phase.name,
                    start.elapsed(),
                    attempt,
                    PhaseError::Timeout {
                        issue,
                        phase: phase.name.clone(),
                        timeout_secs: phase.timeout.as_secs(),
                    },
                )
            }
            Outcome::Cancelled => {
                tracing::info!(issue, phase = %phase.name, "phase cancelled");
                self.terminate(&mut child, issue, &phase.name).await;
                PhaseResult::failed(
                    &phase.name,
                    start.elapsed(),
                    attempt,
                    PhaseError::Cancelled {
                        issue,
                        phase: phase.name.clone(),
                    },
                )
            }
        };

        tracing::debug!(
            issue,
            phase = %phase.name,
            success = result.success,
            exit_code = ?result.exit_code,
            duration_secs = result.duration_seconds,
            "phase finished"
        );
        result
    }

    /// SIGTERM the agent's process group, wait up to the grace period,
    /// then SIGKILL the group.
    async fn terminate(&self, child: &mut Child, issue: u64, phase: &str) {
        let group = child.id();
        signal_group(group, GroupSignal::Terminate);

        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            tracing::warn!(issue, phase, grace_secs = self.kill_grace.as_secs(), "agent ignored SIGTERM, killing");
            signal_group(group, GroupSignal::Kill);
            if let Err(e) = child.kill().await {
                tracing::warn!(issue, phase, error = %e, "failed to kill agent");
            }
        } else {
            // The leader is gone; take down anything it left running.
            signal_group(group, GroupSignal::Kill);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(group: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    // ESRCH only means the group already exited.
    if let Err(e) = killpg(Pid::from_raw(pgid), signal)
        && e != nix::errno::Errno::ESRCH
    {
        tracing::debug!(pgid, ?signal, error = %e, "failed to signal agent process group");
    }
}

#[cfg(not(unix))]
fn signal_group(_group: Option<u32>, _signal: GroupSignal) {}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
