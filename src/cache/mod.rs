//! QA result cache: memoized verdicts of expensive checks.
//!
//! Entries are keyed by check kind and are valid while the working-tree diff
//! hash, the kind's config hash and the TTL all still hold. The document at
//! `.conductor/qa-cache.json` is disposable: anything unreadable is treated
//! as an empty cache.

pub mod hash;
pub mod invalidation;
pub mod store;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use store::{CacheKindStatus, QaCache};

/// The fixed set of cacheable checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    TypeSafety,
    DeletedTests,
    MissingTests,
    Scope,
    Size,
    Security,
    Build,
}

const TEST_FILE_PATTERNS: &[&str] = &[
    "**/*.test.*",
    "**/*.spec.*",
    "**/*_test.*",
    "**/test_*.py",
    "**/tests/**",
    "**/__tests__/**",
];

impl CheckKind {
    pub const ALL: [CheckKind; 7] = [
        CheckKind::TypeSafety,
        CheckKind::DeletedTests,
        CheckKind::MissingTests,
        CheckKind::Scope,
        CheckKind::Size,
        CheckKind::Security,
        CheckKind::Build,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::TypeSafety => "type-safety",
            CheckKind::DeletedTests => "deleted-tests",
            CheckKind::MissingTests => "missing-tests",
            CheckKind::Scope => "scope",
            CheckKind::Size => "size",
            CheckKind::Security => "security",
            CheckKind::Build => "build",
        }
    }

    /// Configuration files whose content feeds this kind's config hash.
    pub fn default_config_files(&self) -> Vec<String> {
        let files: &[&str] = match self {
            CheckKind::TypeSafety => &["tsconfig.json", "tsconfig.*.json", "Cargo.toml", "clippy.toml"],
            CheckKind::DeletedTests | CheckKind::MissingTests => &[
                "jest.config.*",
                "vitest.config.*",
                "pytest.ini",
                "Cargo.toml",
            ],
            CheckKind::Scope | CheckKind::Size => &[],
            CheckKind::Security => &[".npmrc", "deny.toml", ".semgrep.yml"],
            CheckKind::Build => &["Cargo.toml", "package.json", "build.rs", "Makefile"],
        };
        files.iter().map(|s| s.to_string()).collect()
    }

    /// Changed-file globs that invalidate this kind ahead of hash comparison.
    pub fn default_sensitivity(&self) -> Vec<String> {
        let patterns: &[&str] = match self {
            CheckKind::TypeSafety => &["**/*.d.ts", "**/tsconfig*.json"],
            CheckKind::DeletedTests | CheckKind::MissingTests => TEST_FILE_PATTERNS,
            CheckKind::Scope | CheckKind::Size => &[],
            CheckKind::Security => &["**/.env*", "**/auth/**", "**/security/**", "**/*.pem", "**/*.key"],
            CheckKind::Build => &[
                "**/build.rs",
                "**/Makefile",
                "**/Dockerfile",
                "**/webpack.config.*",
                "**/vite.config.*",
            ],
        };
        patterns.iter().map(|s| s.to_string()).collect()
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        CheckKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| {
                let valid: Vec<_> = CheckKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown check kind '{}'. Valid kinds: {}", s, valid.join(", "))
            })
    }
}

/// Verdict payload stored for a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CheckResult {
    pub fn new(passed: bool, message: impl Into<String>) -> Self {
        Self {
            passed,
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissReason {
    NotFound,
    Expired,
    HashMismatch,
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MissReason::NotFound => "not-found",
            MissReason::Expired => "expired",
            MissReason::HashMismatch => "hash-mismatch",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of [`QaCache::get`].
///
/// A stale lookup still carries the cached result so callers can show what
/// the last verdict was.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub hit: bool,
    pub result: Option<CheckResult>,
    pub is_stale: bool,
    pub miss_reason: Option<MissReason>,
    /// What triggered the miss, e.g. the changed file behind an invalidation
    pub detail: Option<String>,
}

impl CacheLookup {
    pub(crate) fn hit(result: CheckResult) -> Self {
        Self {
            hit: true,
            result: Some(result),
            is_stale: false,
            miss_reason: None,
            detail: None,
        }
    }

    pub(crate) fn not_found() -> Self {
        Self {
            hit: false,
            result: None,
            is_stale: false,
            miss_reason: Some(MissReason::NotFound),
            detail: None,
        }
    }

    pub(crate) fn stale(result: CheckResult, reason: MissReason, detail: Option<String>) -> Self {
        Self {
            hit: false,
            result: Some(result),
            is_stale: true,
            miss_reason: Some(reason),
            detail,
        }
    }
}
