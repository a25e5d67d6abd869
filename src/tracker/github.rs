use super::{IssueInfo, IssueTracker, PrState, Probe};
use crate::util::extract_json_object;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Upper bound on a single `gh` call.
const DEFAULT_GH_TIMEOUT: Duration = Duration::from_secs(30);

/// Issue-tracker collaborator backed by the `gh` CLI.
pub struct GhCli {
    gh_cmd: String,
    project_dir: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhIssueView {
    title: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
struct GhPrView {
    state: String,
}

impl GhCli {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            gh_cmd: "gh".to_string(),
            project_dir: project_dir.to_path_buf(),
            timeout: DEFAULT_GH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a different `gh` binary (tests substitute a script).
    pub fn with_command(mut self, gh_cmd: impl Into<String>) -> Self {
        self.gh_cmd = gh_cmd.into();
        self
    }

    /// Run `gh` and return stdout, or the reason it produced nothing usable.
    async fn run(&self, args: &[&str]) -> Result<String, String> {
        let call = Command::new(&self.gh_cmd)
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                format!(
                    "{} {} timed out after {}s",
                    self.gh_cmd,
                    args.join(" "),
                    self.timeout.as_secs_f64()
                )
            })?
            .map_err(|e| format!("failed to run {}: {}", self.gh_cmd, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} {} exited with {}: {}",
                self.gh_cmd,
                args.join(" "),
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn parse_json<T: serde::de::DeserializeOwned>(stdout: &str) -> Result<T, String> {
        let json = extract_json_object(stdout).ok_or_else(|| "no JSON in gh output".to_string())?;
        serde_json::from_str(&json).map_err(|e| format!("unparsable gh output: {}", e))
    }
}

#[async_trait]
impl IssueTracker for GhCli {
    async fn issue_info(&self, issue: u64) -> Probe<IssueInfo> {
        let number = issue.to_string();
        let result = self
            .run(&["issue", "view", &number, "--json", "title,labels"])
            .await
            .and_then(|stdout| Self::parse_json::<GhIssueView>(&stdout));

        match result {
            Ok(view) => Probe::Known(IssueInfo {
                title: view.title,
                labels: view.labels.into_iter().map(|l| l.name).collect(),
            }),
            Err(reason) => {
                tracing::debug!(issue, %reason, "issue lookup unavailable");
                Probe::Unavailable(reason)
            }
        }
    }

    async fn pr_state(&self, pr_number: u64) -> Probe<PrState> {
        let number = pr_number.to_string();
        let result = self
            .run(&["pr", "view", &number, "--json", "state"])
            .await
            .and_then(|stdout| Self::parse_json::<GhPrView>(&stdout));

        match result {
            Ok(view) => Probe::Known(PrState::parse(&view.state)),
            Err(reason) => {
                tracing::debug!(pr = pr_number, %reason, "PR state unavailable");
                Probe::Unavailable(reason)
            }
        }
    }
}
