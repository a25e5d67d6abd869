//! QA cache inspection: `conductor cache ...`.

use anyhow::{Context, Result};
use console::style;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use conductor::cache::{CheckKind, CheckResult, QaCache};
use conductor::config::Config;
use conductor::tracker::GitTracker;
use conductor::ui::icons::{CHECK, CROSS};

use super::super::CacheCommands;

fn open_cache(config: &Config) -> QaCache {
    QaCache::new(
        &config.cache_file,
        &config.project_dir,
        Arc::new(GitTracker::new(&config.project_dir)),
        config.toml.cache.clone(),
        config.base_branch(),
    )
}

fn parse_kind(kind: &str) -> Result<CheckKind> {
    kind.parse::<CheckKind>().map_err(anyhow::Error::msg)
}

pub fn cmd_cache(config: &Config, command: &CacheCommands) -> Result<ExitCode> {
    let cache = open_cache(config);

    match command {
        CacheCommands::Status => {
            println!();
            println!("QA cache: {}", cache.path().display());
            println!();
            println!("{:<15} {:<8} {:<22} Detail", "Kind", "State", "Cached at");
            println!(
                "{:<15} {:<8} {:<22} ------",
                "---------------", "--------", "----------------------"
            );
            for row in cache.get_status() {
                let state = if row.lookup.hit {
                    style("hit".to_string()).green()
                } else if row.lookup.is_stale {
                    style("stale".to_string()).yellow()
                } else {
                    style("empty".to_string()).dim()
                };
                let cached_at = row
                    .cached_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let detail = match (row.lookup.miss_reason, row.lookup.detail) {
                    (None, _) => row
                        .lookup
                        .result
                        .map(|r| r.message)
                        .unwrap_or_default(),
                    (Some(reason), Some(detail)) => format!("{}: {}", reason, detail),
                    (Some(reason), None) => reason.to_string(),
                };
                println!("{:<15} {:<8} {:<22} {}", row.kind, state, cached_at, detail);
            }
            println!();
            Ok(ExitCode::SUCCESS)
        }
        CacheCommands::Get { kind } => {
            let kind = parse_kind(kind)?;
            let lookup = cache.get(kind);
            if lookup.hit {
                let result = lookup.result.unwrap_or_else(|| CheckResult::new(true, ""));
                let icon = if result.passed { CHECK } else { CROSS };
                println!("{}{} hit: {}", icon, kind, result.message);
                Ok(ExitCode::SUCCESS)
            } else {
                let reason = lookup
                    .miss_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "miss".to_string());
                match lookup.detail {
                    Some(detail) => println!("{} miss ({}: {})", kind, reason, detail),
                    None => println!("{} miss ({})", kind, reason),
                }
                Ok(ExitCode::FAILURE)
            }
        }
        CacheCommands::Set {
            kind,
            failed,
            message,
            ttl_secs,
        } => {
            let kind = parse_kind(kind)?;
            let result = CheckResult::new(!failed, message.clone().unwrap_or_default());
            let ttl = ttl_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.cache_ttl());
            cache
                .set(kind, result, Some(ttl))
                .with_context(|| format!("Failed to cache {} result", kind))?;
            println!("Cached {} result", kind);
            Ok(ExitCode::SUCCESS)
        }
        CacheCommands::Clear { kind } => {
            match kind {
                Some(kind) => {
                    let kind = parse_kind(kind)?;
                    if cache.clear(kind)? {
                        println!("Cleared {}", kind);
                    } else {
                        println!("No cached {} result", kind);
                    }
                }
                None => {
                    let count = cache.clear_all()?;
                    println!("Cleared {} cached result(s)", count);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        CacheCommands::Invalidate => {
            let evicted = cache.invalidate_for_changes()?;
            if evicted.is_empty() {
                println!("No cached results invalidated.");
            }
            for (kind, reason) in evicted {
                println!("Evicted {} ({})", kind, reason);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
