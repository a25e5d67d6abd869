//! Phase catalogue: the ordered steps run for each issue.
//!
//! A phase is a name plus the directive passed to the agent and the
//! wall-clock timeout it runs under. Directives and timeouts come from
//! `conductor.toml` defaults and glob-pattern overrides.

use crate::conductor_config::ConductorToml;
use crate::errors::OrchestratorError;
use std::collections::HashSet;
use std::time::Duration;

/// A single named step executed as one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    /// Directive template with `{phase}` and `{issue}` placeholders
    pub directive: String,
    pub timeout: Duration,
}

impl Phase {
    pub fn new(name: &str, directive: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            directive: directive.to_string(),
            timeout,
        }
    }

    /// Directive with placeholders filled in for `issue`.
    pub fn render_directive(&self, issue: u64) -> String {
        self.directive
            .replace("{phase}", &self.name)
            .replace("{issue}", &issue.to_string())
    }
}

/// Ordered phases resolved for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    phases: Vec<Phase>,
}

impl PhasePlan {
    /// Resolve phase names against the configuration.
    ///
    /// `timeout_override` (from `--timeout`) replaces every per-phase timeout.
    pub fn resolve(
        names: &[String],
        config: &ConductorToml,
        timeout_override: Option<Duration>,
    ) -> Result<Self, OrchestratorError> {
        if names.is_empty() {
            return Err(OrchestratorError::InvalidFlag(
                "at least one phase is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut phases = Vec::with_capacity(names.len());
        for raw in names {
            let name = raw.trim();
            if name.is_empty() {
                return Err(OrchestratorError::InvalidFlag(
                    "phase names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.to_string()) {
                return Err(OrchestratorError::InvalidFlag(format!(
                    "phase '{}' listed more than once",
                    name
                )));
            }

            let settings = config.phase_settings(name);
            let timeout = match timeout_override {
                Some(t) => t,
                None => Duration::from_secs(settings.timeout_secs),
            };
            if timeout.is_zero() {
                return Err(OrchestratorError::InvalidFlag(format!(
                    "phase '{}' has a zero timeout",
                    name
                )));
            }
            phases.push(Phase::new(name, &settings.directive, timeout));
        }

        Ok(Self { phases })
    }

    /// Split a comma-separated `--phases` value.
    pub fn parse_list(value: &str) -> Vec<String> {
        value.split(',').map(|s| s.trim().to_string()).collect()
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}
