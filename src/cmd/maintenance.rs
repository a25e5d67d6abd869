//! State upkeep: `conductor reconcile` and `conductor cleanup`.

use anyhow::Result;
use console::style;

use conductor::config::Config;
use conductor::state::{
    CleanupAction, CleanupOptions, MergeEvidence, StateStore, cleanup_stale_entries,
    reconcile_state_at_startup,
};
use conductor::tracker::{GhCli, GitTracker};
use conductor::ui::icons::{BROOM, MERGED};

pub async fn cmd_reconcile(config: &Config) -> Result<()> {
    let mut store = StateStore::new(&config.state_file);
    let tracker = GhCli::new(&config.project_dir);
    let vcs = GitTracker::new(&config.project_dir);

    let report =
        reconcile_state_at_startup(&mut store, &tracker, &vcs, config.base_branch()).await?;

    if report.checked.is_empty() {
        println!("No issues are waiting for merge.");
        return Ok(());
    }

    println!(
        "Checked {} issue(s) awaiting merge against '{}'",
        report.checked.len(),
        config.base_branch()
    );
    for (issue, evidence) in &report.promoted {
        let source = match evidence {
            MergeEvidence::PullRequest => "pull request merged",
            MergeEvidence::BranchAncestry => "branch contained in base",
        };
        println!("  {}#{} merged ({})", MERGED, issue, style(source).dim());
    }
    for issue in &report.unresolved {
        println!(
            "  #{} {}",
            issue,
            style("could not be checked; left as ready_for_merge").yellow()
        );
    }
    if report.promoted.is_empty() {
        println!("No merges detected.");
    }
    Ok(())
}

pub async fn cmd_cleanup(
    config: &Config,
    dry_run: bool,
    force: bool,
    max_age_days: Option<u32>,
) -> Result<()> {
    let mut store = StateStore::new(&config.state_file);
    let tracker = GhCli::new(&config.project_dir);
    let vcs = GitTracker::new(&config.project_dir);

    let days = max_age_days.unwrap_or(config.toml.cleanup.max_age_days);
    let options = CleanupOptions {
        dry_run,
        force_remove: force,
        max_age: (days > 0).then(|| chrono::Duration::days(i64::from(days))),
    };

    let report = cleanup_stale_entries(&mut store, &tracker, &vcs, &options).await?;

    if report.actions.is_empty() {
        println!("Nothing to clean up.");
        return Ok(());
    }

    let prefix = if dry_run { "Would clean" } else { "Cleaned" };
    println!("{}{} {} entr(ies):", BROOM, prefix, report.actions.len());
    for action in &report.actions {
        match action {
            CleanupAction::Removed { issue, reason } => {
                println!("  #{} removed ({})", issue, reason);
            }
            CleanupAction::MarkedAbandoned { issue } => {
                println!(
                    "  #{} marked abandoned {}",
                    issue,
                    style("(use --force to remove)").dim()
                );
            }
        }
    }
    Ok(())
}
