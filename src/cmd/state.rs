//! State document maintenance: `conductor state rebuild`.

use anyhow::Result;
use console::style;

use conductor::audit::RunLogger;
use conductor::config::Config;
use conductor::state::{StateStore, rebuild_from_runs};
use conductor::tracker::{GhCli, IssueTracker, Probe};

/// Reconstruct the state document from finished Run Logs.
///
/// An existing document that loads and tracks issues is only replaced with
/// `--force`. A document that fails to load may always be replaced, since
/// that is what rebuilding is for.
pub async fn cmd_state_rebuild(config: &Config, force: bool) -> Result<()> {
    let mut store = StateStore::new(&config.state_file);
    match store.load() {
        Ok(existing) if !existing.issues.is_empty() && !force => {
            anyhow::bail!(
                "State document {} already tracks {} issue(s). Use --force to overwrite it.",
                config.state_file.display(),
                existing.issues.len()
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "replacing unreadable state document");
            println!("{} {}", style("Existing state is unreadable:").yellow(), e);
        }
    }

    let logger = RunLogger::new(&config.log_dir);
    let runs = logger.load_all_runs()?;
    if runs.is_empty() {
        anyhow::bail!(
            "No run logs found in {}; nothing to rebuild from.",
            logger.runs_dir().display()
        );
    }

    let mut state = rebuild_from_runs(&runs);

    let tracker = GhCli::new(&config.project_dir);
    for record in state.issues.values_mut() {
        if let Probe::Known(info) = tracker.issue_info(record.number).await {
            record.title = info.title;
        }
    }

    let count = state.issues.len();
    store.save_state(state)?;
    println!(
        "Rebuilt {} issue(s) from {} run log(s) into {}",
        count,
        runs.len(),
        config.state_file.display()
    );
    Ok(())
}
