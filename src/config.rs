use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::conductor_config::ConductorToml;

/// The name of the conductor directory inside a project.
pub const CONDUCTOR_DIR: &str = ".conductor";

/// Runtime configuration for the conductor.
///
/// Bridges the file-based `ConductorToml` with the paths and resolved values
/// the engine, stores and commands need.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub state_file: PathBuf,
    pub cache_file: PathBuf,
    pub log_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub agent_cmd: String,
    pub verbose: bool,
    /// The underlying file configuration
    pub toml: ConductorToml,
}

impl Config {
    pub fn new(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let toml = ConductorToml::load_or_default(&conductor_dir)?;
        let agent_cmd = toml.agent_cmd();
        let log_dir = conductor_dir.join("logs");

        Ok(Self {
            state_file: conductor_dir.join("state.json"),
            cache_file: conductor_dir.join("qa-cache.json"),
            runs_dir: log_dir.join("runs"),
            log_dir,
            conductor_dir,
            project_dir,
            agent_cmd,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.conductor_dir)
            .context("Failed to create conductor directory")?;
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        Ok(())
    }

    pub fn base_branch(&self) -> &str {
        &self.toml.project.base_branch
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.toml.defaults.kill_grace_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.shutdown.timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.toml.cache.ttl_secs)
    }
}

/// Locate `name` on `PATH`, or accept it directly if it is a path to an existing file.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}
