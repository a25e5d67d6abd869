//! Unified configuration for the conductor.
//!
//! Settings are read from `.conductor/conductor.toml`, then overridden by
//! environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! agent_cmd = "claude"
//! agent_args = ["--print"]
//! base_branch = "main"
//!
//! [defaults]
//! phases = ["spec", "exec", "qa"]
//! mode = "sequential"
//! phase_timeout_secs = 1800
//! kill_grace_secs = 5
//! directive = "/{phase} {issue}"
//!
//! [phases.overrides."qa*"]
//! timeout_secs = 3600
//!
//! [cache]
//! ttl_secs = 86400
//!
//! [cache.sensitivity]
//! missing-tests = ["**/tests/**", "**/*_test.*"]
//!
//! [cleanup]
//! max_age_days = 7
//!
//! [shutdown]
//! timeout_secs = 30
//!
//! [quality_loop]
//! enabled = false
//! max_iterations = 3
//! phases = ["qa"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::cache::CheckKind;

/// How a batch of issues is driven through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Finish one issue's chain before the next; abort the queue on first failure.
    #[default]
    Sequential,
    /// Drive every issue regardless of sibling failures.
    FanOut,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::FanOut => write!(f, "fan-out"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = crate::errors::OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "fan-out" | "fanout" | "parallel" => Ok(ExecutionMode::FanOut),
            other => Err(crate::errors::OrchestratorError::UnknownExecutionMode(
                other.to_string(),
            )),
        }
    }
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Agent binary invoked once per phase
    #[serde(default)]
    pub agent_cmd: Option<String>,
    /// Arguments placed before the directive
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Branch that diffs and merge checks are measured against
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_agent_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            agent_cmd: None,
            agent_args: default_agent_args(),
            base_branch: default_base_branch(),
        }
    }
}

/// Default settings for all runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Seconds between the graceful terminate and the forced kill
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    /// Directive template; `{phase}` and `{issue}` are substituted
    #[serde(default = "default_directive")]
    pub directive: String,
    /// Worker-pool bound for fan-out mode
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Completing this phase marks the issue ready for merge
    #[serde(default = "default_ready_phase")]
    pub ready_phase: String,
}

fn default_phases() -> Vec<String> {
    vec!["spec".to_string(), "exec".to_string(), "qa".to_string()]
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_directive() -> String {
    "/{phase} {issue}".to_string()
}

fn default_max_parallel() -> usize {
    1
}

fn default_ready_phase() -> String {
    "qa".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            phases: default_phases(),
            mode: ExecutionMode::default(),
            phase_timeout_secs: default_phase_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            directive: default_directive(),
            max_parallel: default_max_parallel(),
            ready_phase: default_ready_phase(),
        }
    }
}

/// Phase-specific override settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub directive: Option<String>,
}

/// Phase override configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Pattern-based overrides (e.g., "qa*" -> PhaseOverride)
    #[serde(default)]
    pub overrides: HashMap<String, PhaseOverride>,
}

/// QA result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Files whose change invalidates every cached entry
    #[serde(default = "default_global_files")]
    pub global_files: Vec<String>,
    /// Per-kind config file globs, replacing the built-in list for that kind
    #[serde(default)]
    pub config_files: HashMap<String, Vec<String>>,
    /// Per-kind sensitivity globs, replacing the built-in list for that kind
    #[serde(default)]
    pub sensitivity: HashMap<String, Vec<String>>,
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_global_files() -> Vec<String> {
    [
        "Cargo.lock",
        "Cargo.toml",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "package.json",
        "tsconfig.json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            global_files: default_global_files(),
            config_files: HashMap::new(),
            sensitivity: HashMap::new(),
        }
    }
}

impl CacheSection {
    /// Config file globs for a kind, falling back to the built-in defaults.
    pub fn config_files_for(&self, kind: CheckKind) -> Vec<String> {
        self.config_files
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| kind.default_config_files())
    }

    /// Sensitivity globs for a kind, falling back to the built-in defaults.
    pub fn sensitivity_for(&self, kind: CheckKind) -> Vec<String> {
        self.sensitivity
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| kind.default_sensitivity())
    }
}

/// Stale-entry cleanup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSection {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_max_age_days() -> u32 {
    7
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_shutdown_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// Quality loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityLoopSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Phases whose failure triggers a retry
    #[serde(default = "default_loop_phases")]
    pub phases: Vec<String>,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_loop_phases() -> Vec<String> {
    vec!["qa".to_string()]
}

impl Default for QualityLoopSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
            phases: default_loop_phases(),
        }
    }
}

/// The complete conductor.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConductorToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub phases: PhasesConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
    #[serde(default)]
    pub quality_loop: QualityLoopSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load configuration from `<conductor_dir>/conductor.toml`.
    /// Returns default configuration if file doesn't exist.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let config_path = conductor_dir.join("conductor.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the agent command (file → env → default).
    pub fn agent_cmd(&self) -> String {
        std::env::var("CONDUCTOR_AGENT_CMD")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.project.agent_cmd.clone())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Get effective settings for a specific phase, applying pattern overrides.
    ///
    /// Overrides are applied in sorted pattern order so the result does not
    /// depend on map iteration order.
    pub fn phase_settings(&self, phase_name: &str) -> PhaseSettings {
        let mut settings = PhaseSettings {
            timeout_secs: self.defaults.phase_timeout_secs,
            directive: self.defaults.directive.clone(),
        };

        let mut patterns: Vec<_> = self.phases.overrides.iter().collect();
        patterns.sort_by(|a, b| a.0.cmp(b.0));

        for (pattern, override_cfg) in patterns {
            if pattern_matches(pattern, phase_name) {
                if let Some(timeout) = override_cfg.timeout_secs {
                    settings.timeout_secs = timeout;
                }
                if let Some(ref directive) = override_cfg.directive {
                    settings.directive = directive.clone();
                }
            }
        }

        settings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.phase_timeout_secs == 0 {
            warnings.push("phase_timeout_secs is 0; every phase will time out".to_string());
        }
        if self.shutdown.timeout_secs == 0 {
            warnings.push("shutdown timeout_secs is 0; cleanup will never run".to_string());
        }
        if self.defaults.max_parallel == 0 {
            warnings.push("max_parallel is 0; treated as 1".to_string());
        }

        for kind in self
            .cache
            .config_files
            .keys()
            .chain(self.cache.sensitivity.keys())
        {
            if CheckKind::from_str(kind).is_err() {
                warnings.push(format!("Unknown check kind '{}' in [cache]", kind));
            }
        }

        for (pattern, override_cfg) in &self.phases.overrides {
            if override_cfg.timeout_secs == Some(0) {
                warnings.push(format!("Override '{}' sets timeout_secs to 0", pattern));
            }
        }

        warnings.sort();
        warnings
    }
}

/// Resolved settings for a specific phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSettings {
    pub timeout_secs: u64,
    pub directive: String,
}

/// Check if a pattern matches a phase name (case-insensitive, `*` and `?`).
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches_with(name, options),
        Err(_) => pattern.eq_ignore_ascii_case(name),
    }
}
