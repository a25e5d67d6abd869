use super::hash::{config_hash, diff_hash};
use super::invalidation::{self, Fingerprints, Invalidation};
use super::{CacheLookup, CheckKind, CheckResult, MissReason};
use crate::conductor_config::CacheSection;
use crate::tracker::{Probe, VersionControl};
use crate::util::atomic_write;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<CheckKind, CachedCheckResult>,
}

impl CacheDocument {
    fn empty() -> Self {
        Self {
            version: CACHE_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// One cached verdict. Always written whole by `set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCheckResult {
    pub diff_hash: String,
    pub config_hash: String,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub result: CheckResult,
    /// Changed-file fingerprints at caching time
    #[serde(default)]
    pub changed_files: Fingerprints,
}

impl CachedCheckResult {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.cached_at;
        age.num_milliseconds() < 0 || age.num_seconds() as u64 >= self.ttl_secs
    }
}

/// Per-kind row for `get_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKindStatus {
    pub kind: CheckKind,
    pub cached_at: Option<DateTime<Utc>>,
    pub lookup: CacheLookup,
}

/// Working-tree observations shared by every lookup of one operation.
struct TreeSnapshot {
    diff_hash: String,
    changed: Option<Fingerprints>,
}

/// Exclusive accessor for the QA cache document.
///
/// Every operation loads the document, works on it and (for writes) saves
/// it back atomically. Nothing is held in memory between calls.
pub struct QaCache {
    cache_file: PathBuf,
    project_dir: PathBuf,
    vcs: Arc<dyn VersionControl>,
    settings: CacheSection,
    base_branch: String,
}

impl QaCache {
    pub fn new(
        cache_file: &Path,
        project_dir: &Path,
        vcs: Arc<dyn VersionControl>,
        settings: CacheSection,
        base_branch: &str,
    ) -> Self {
        Self {
            cache_file: cache_file.to_path_buf(),
            project_dir: project_dir.to_path_buf(),
            vcs,
            settings,
            base_branch: base_branch.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.cache_file
    }

    fn load(&self) -> CacheDocument {
        let content = match std::fs::read_to_string(&self.cache_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheDocument::empty(),
            Err(e) => {
                tracing::warn!(path = %self.cache_file.display(), error = %e, "cache unreadable, treating as empty");
                return CacheDocument::empty();
            }
        };

        match serde_json::from_str::<CacheDocument>(&content) {
            Ok(doc) if doc.version == CACHE_SCHEMA_VERSION => doc,
            Ok(doc) => {
                tracing::warn!(
                    found = doc.version,
                    expected = CACHE_SCHEMA_VERSION,
                    "cache schema mismatch, treating as empty"
                );
                CacheDocument::empty()
            }
            Err(e) => {
                tracing::warn!(path = %self.cache_file.display(), error = %e, "cache corrupt, treating as empty");
                CacheDocument::empty()
            }
        }
    }

    fn save(&self, doc: &CacheDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc).context("Failed to serialize QA cache")?;
        atomic_write(&self.cache_file, json.as_bytes())
            .with_context(|| format!("Failed to write QA cache {}", self.cache_file.display()))
    }

    fn snapshot(&self) -> TreeSnapshot {
        let diff = self.vcs.diff_text(&self.base_branch);
        let changed = match self.vcs.changed_files(&self.base_branch) {
            Probe::Known(files) => Some(
                files
                    .into_iter()
                    .map(|f| (f.path, f.fingerprint))
                    .collect(),
            ),
            Probe::Unavailable(reason) => {
                tracing::debug!(%reason, "changed files unavailable, skipping early invalidation");
                None
            }
        };
        TreeSnapshot {
            diff_hash: diff_hash(&diff),
            changed,
        }
    }

    fn config_hash_for(&self, kind: CheckKind) -> String {
        config_hash(kind, &self.settings.config_files_for(kind), &self.project_dir)
    }

    fn invalidation_for(
        &self,
        kind: CheckKind,
        entry: &CachedCheckResult,
        snapshot: &TreeSnapshot,
    ) -> Option<Invalidation> {
        let current = snapshot.changed.as_ref()?;
        let changed = invalidation::changed_since(&entry.changed_files, current);
        invalidation::check(kind, &self.settings, &changed)
    }

    /// Validity checks in order: not-found, expired, early invalidation, hashes.
    fn lookup(
        &self,
        kind: CheckKind,
        doc: &CacheDocument,
        snapshot: &TreeSnapshot,
        now: DateTime<Utc>,
    ) -> CacheLookup {
        let Some(entry) = doc.entries.get(&kind) else {
            return CacheLookup::not_found();
        };

        if entry.is_expired(now) {
            return CacheLookup::stale(entry.result.clone(), MissReason::Expired, None);
        }

        if let Some(inv) = self.invalidation_for(kind, entry, snapshot) {
            return CacheLookup::stale(
                entry.result.clone(),
                MissReason::HashMismatch,
                Some(inv.to_string()),
            );
        }

        if entry.diff_hash != snapshot.diff_hash {
            return CacheLookup::stale(
                entry.result.clone(),
                MissReason::HashMismatch,
                Some("working tree diff changed".to_string()),
            );
        }

        if entry.config_hash != self.config_hash_for(kind) {
            return CacheLookup::stale(
                entry.result.clone(),
                MissReason::HashMismatch,
                Some("configuration changed".to_string()),
            );
        }

        CacheLookup::hit(entry.result.clone())
    }

    pub fn get(&self, kind: CheckKind) -> CacheLookup {
        let doc = self.load();
        let snapshot = self.snapshot();
        let lookup = self.lookup(kind, &doc, &snapshot, Utc::now());
        tracing::debug!(
            kind = %kind,
            hit = lookup.hit,
            reason = ?lookup.miss_reason,
            "cache lookup"
        );
        lookup
    }

    /// Store a verdict against the current tree and config. `ttl` defaults
    /// to the configured cache TTL.
    pub fn set(&self, kind: CheckKind, result: CheckResult, ttl: Option<Duration>) -> Result<()> {
        let mut doc = self.load();
        let snapshot = self.snapshot();
        let ttl_secs = ttl
            .map(|t| t.as_secs())
            .unwrap_or(self.settings.ttl_secs);

        doc.entries.insert(
            kind,
            CachedCheckResult {
                diff_hash: snapshot.diff_hash,
                config_hash: self.config_hash_for(kind),
                cached_at: Utc::now(),
                ttl_secs,
                result,
                changed_files: snapshot.changed.unwrap_or_default(),
            },
        );
        self.save(&doc)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn clear(&self, kind: CheckKind) -> Result<bool> {
        let mut doc = self.load();
        let existed = doc.entries.remove(&kind).is_some();
        if existed {
            self.save(&doc)?;
        }
        Ok(existed)
    }

    /// Remove every entry. Returns how many there were.
    pub fn clear_all(&self) -> Result<usize> {
        let doc = self.load();
        let count = doc.entries.len();
        self.save(&CacheDocument::empty())?;
        Ok(count)
    }

    /// Lookup result for every known check kind.
    pub fn get_status(&self) -> Vec<CacheKindStatus> {
        let doc = self.load();
        let snapshot = self.snapshot();
        let now = Utc::now();
        CheckKind::ALL
            .into_iter()
            .map(|kind| CacheKindStatus {
                kind,
                cached_at: doc.entries.get(&kind).map(|e| e.cached_at),
                lookup: self.lookup(kind, &doc, &snapshot, now),
            })
            .collect()
    }

    /// Evict entries hit by global or type-specific invalidation.
    pub fn invalidate_for_changes(&self) -> Result<Vec<(CheckKind, String)>> {
        let mut doc = self.load();
        let snapshot = self.snapshot();

        let evicted: Vec<(CheckKind, String)> = doc
            .entries
            .iter()
            .filter_map(|(kind, entry)| {
                self.invalidation_for(*kind, entry, &snapshot)
                    .map(|inv| (*kind, inv.to_string()))
            })
            .collect();

        if !evicted.is_empty() {
            for (kind, why) in &evicted {
                tracing::info!(kind = %kind, reason = %why, "evicting cache entry");
                doc.entries.remove(kind);
            }
            self.save(&doc)?;
        }
        Ok(evicted)
    }
}
