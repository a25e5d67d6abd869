//! Content hashes used as cache validity keys.

use super::CheckKind;
use crate::tracker::Probe;
use crate::util::sha256_hex;
use std::path::Path;

/// Hash of the working-tree diff.
///
/// When the diff cannot be computed the hash is salted with a fresh nonce,
/// so it matches nothing and every lookup misses.
pub fn diff_hash(diff: &Probe<String>) -> String {
    match diff {
        Probe::Known(text) => sha256_hex(format!("diff\0{}", text)),
        Probe::Unavailable(reason) => {
            tracing::debug!(%reason, "diff unavailable, cache will miss");
            sha256_hex(format!("unavailable\0{}\0{}", reason, uuid::Uuid::new_v4()))
        }
    }
}

/// Hash of the configuration files relevant to `kind`.
///
/// Patterns are globbed relative to `project_dir`; matched files are hashed
/// in sorted order together with their paths. Missing files contribute
/// nothing, and the kind name is always part of the input so two kinds with
/// the same file set still hash differently.
pub fn config_hash(kind: CheckKind, patterns: &[String], project_dir: &Path) -> String {
    let mut files: Vec<String> = Vec::new();
    for pattern in patterns {
        let full = project_dir.join(pattern);
        let Some(full) = full.to_str() else {
            continue;
        };
        let Ok(paths) = glob::glob(full) else {
            tracing::debug!(%pattern, "invalid config glob skipped");
            continue;
        };
        for path in paths.flatten() {
            if !path.is_file() {
                continue;
            }
            let rel = path
                .strip_prefix(project_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            files.push(rel);
        }
    }
    files.sort();
    files.dedup();

    let mut input = format!("kind\0{}\n", kind.as_str());
    for rel in &files {
        let content = std::fs::read(project_dir.join(rel)).unwrap_or_default();
        input.push_str(&format!("{}\0{}\n", rel, sha256_hex(&content)));
    }
    sha256_hex(input)
}
