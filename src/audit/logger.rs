use super::{PhaseLog, RunConfig, RunLog};
use crate::state::PhaseStatus;
use crate::util::atomic_write;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct RunLogger {
    log_dir: PathBuf,
    current_run: Option<RunLog>,
    current_run_file: PathBuf,
    /// Set once the run has been written to `runs/`
    finished: Option<PathBuf>,
}

impl RunLogger {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            current_run: None,
            current_run_file: log_dir.join("current-run.json"),
            finished: None,
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.log_dir.join("runs")
    }

    /// Begin a new run. A `current-run.json` left by a process that never
    /// finished its run is archived into `runs/` first.
    pub fn start_run(&mut self, config: RunConfig) -> Result<Uuid> {
        if let Some(path) = self.archive_interrupted()? {
            tracing::warn!(path = %path.display(), "archived run log left by an interrupted process");
        }
        let run = RunLog::new(config);
        let id = run.run_id;
        self.current_run = Some(run);
        self.finished = None;
        self.save_current()?;
        Ok(id)
    }

    fn active_run(&mut self, op: &str) -> Result<&mut RunLog> {
        if self.finished.is_some() {
            anyhow::bail!("{} called after the run was finished", op);
        }
        self.current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("{} called with no active run", op))
    }

    pub fn issue_started(&mut self, issue: u64) -> Result<()> {
        self.active_run("issue_started")?.issue_mut(issue);
        self.save_current()
    }

    pub fn phase_started(&mut self, issue: u64, phase: &str, attempt: u32) -> Result<()> {
        self.active_run("phase_started")?
            .issue_mut(issue)
            .phases
            .push(PhaseLog::new(phase, attempt));
        self.save_current()
    }

    /// Close the latest open timeline entry for `phase`.
    pub fn phase_finished(
        &mut self,
        issue: u64,
        phase: &str,
        status: PhaseStatus,
        error: Option<String>,
    ) -> Result<()> {
        let log = self.active_run("phase_finished")?.issue_mut(issue);
        let entry = log
            .phases
            .iter_mut()
            .rev()
            .find(|p| p.phase == phase && p.ended_at.is_none())
            .ok_or_else(|| {
                anyhow::anyhow!("phase_finished for #{} '{}' without a started entry", issue, phase)
            })?;
        entry.finish(status, error);
        self.save_current()
    }

    pub fn issue_finished(&mut self, issue: u64, success: bool) -> Result<()> {
        let log = self.active_run("issue_finished")?.issue_mut(issue);
        log.success = Some(success);
        log.ended_at = Some(chrono::Utc::now());
        self.save_current()
    }

    /// Write the run to `runs/` and drop `current-run.json`.
    ///
    /// Calling it again returns the same path without rewriting the file.
    pub fn finish_run(&mut self) -> Result<PathBuf> {
        if let Some(ref path) = self.finished {
            return Ok(path.clone());
        }

        self.current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?
            .finish();
        let run = self
            .current_run
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        let run_file = self.archive(run)?;
        self.finished = Some(run_file.clone());
        Ok(run_file)
    }

    /// Write a finished run to `runs/` and drop `current-run.json`.
    fn archive(&self, run: &RunLog) -> Result<PathBuf> {
        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.simple().to_string()[..8]
        );
        let run_file = self.runs_dir().join(&filename);

        let json = serde_json::to_string_pretty(run).context("Failed to serialize run log")?;
        atomic_write(&run_file, json.as_bytes()).context("Failed to write run log file")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }

        tracing::debug!(path = %run_file.display(), "run log written");
        Ok(run_file)
    }

    /// Close out a run whose process exited before `finish_run`.
    ///
    /// Open timeline entries are marked interrupted. An unparsable file is
    /// left for the next `start_run` to overwrite.
    fn archive_interrupted(&self) -> Result<Option<PathBuf>> {
        if !self.current_run_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.current_run_file)
            .context("Failed to read current run file")?;
        let mut run: RunLog = match serde_json::from_str(&content) {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unparsable current-run.json");
                return Ok(None);
            }
        };
        run.mark_interrupted();
        self.archive(&run).map(Some)
    }

    pub fn save_current(&self) -> Result<()> {
        if self.finished.is_some() {
            return Ok(());
        }
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(&run).context("Failed to serialize current run")?;
            atomic_write(&self.current_run_file, json.as_bytes())
                .context("Failed to write current run file")?;
        }
        Ok(())
    }

    pub fn current_run(&self) -> Option<&RunLog> {
        self.current_run.as_ref()
    }

    /// Finished run files, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<RunLog> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run log {}", path.display()))?;
        let run: RunLog = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run log {}", path.display()))?;
        Ok(run)
    }

    /// Every readable finished run. Unparsable files are skipped with a warning.
    pub fn load_all_runs(&self) -> Result<Vec<RunLog>> {
        let mut runs = Vec::new();
        for path in self.list_runs()? {
            match self.load_run(&path) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable run log"),
            }
        }
        Ok(runs)
    }
}
