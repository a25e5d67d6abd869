//! Early invalidation from the set of files changed since an entry was cached.

use super::CheckKind;
use crate::conductor_config::CacheSection;
use glob::{MatchOptions, Pattern};
use std::collections::{BTreeMap, BTreeSet};

/// Path → patch fingerprint for every file differing from the merge-base.
pub type Fingerprints = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// A lock or shared build file changed
    Global { file: String },
    /// A file matching the kind's sensitivity patterns changed
    Sensitive { file: String },
}

impl std::fmt::Display for Invalidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invalidation::Global { file } => write!(f, "global file changed: {}", file),
            Invalidation::Sensitive { file } => write!(f, "sensitive file changed: {}", file),
        }
    }
}

/// Files whose change state differs between two fingerprint sets:
/// newly changed, changed again, or reverted.
pub fn changed_since(cached: &Fingerprints, current: &Fingerprints) -> Vec<String> {
    let mut paths: BTreeSet<&String> = BTreeSet::new();
    for (path, fp) in current {
        if cached.get(path) != Some(fp) {
            paths.insert(path);
        }
    }
    for path in cached.keys() {
        if !current.contains_key(path) {
            paths.insert(path);
        }
    }
    paths.into_iter().cloned().collect()
}

/// Glob match against a repository-relative path.
///
/// A pattern without `/` is matched against the file name alone, so
/// `Cargo.lock` covers lock files in every workspace member.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let Ok(compiled) = Pattern::new(pattern) else {
        return false;
    };
    if pattern.contains('/') {
        return compiled.matches_with(path, options);
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    compiled.matches_with(name, options)
}

/// First rule that invalidates `kind`, given the files changed since caching.
pub fn check(kind: CheckKind, settings: &CacheSection, changed: &[String]) -> Option<Invalidation> {
    if let Some(file) = changed
        .iter()
        .find(|f| settings.global_files.iter().any(|p| path_matches(p, f)))
    {
        return Some(Invalidation::Global { file: file.clone() });
    }

    let sensitivity = settings.sensitivity_for(kind);
    changed
        .iter()
        .find(|f| sensitivity.iter().any(|p| path_matches(p, f)))
        .map(|file| Invalidation::Sensitive { file: file.clone() })
}
