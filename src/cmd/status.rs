//! Workflow state display: `conductor status`.

use anyhow::Result;
use console::style;

use conductor::config::Config;
use conductor::state::{IssueState, IssueStatus, PhaseStatus, StateStore};

fn status_style(status: IssueStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        IssueStatus::ReadyForMerge | IssueStatus::Merged => style(text).green(),
        IssueStatus::Blocked => style(text).red(),
        IssueStatus::Abandoned => style(text).dim(),
        IssueStatus::InProgress => style(text).yellow(),
        IssueStatus::NotStarted => style(text),
    }
}

fn phase_marker(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Pending => " ",
        PhaseStatus::InProgress => ">",
        PhaseStatus::Completed => "✓",
        PhaseStatus::Failed => "✗",
        PhaseStatus::Skipped => "-",
    }
}

fn print_issue(issue: &IssueState, detailed: bool) {
    println!(
        "#{:<6} {:<16} {:<12} {}",
        issue.number,
        status_style(issue.status),
        issue.current_phase.as_deref().unwrap_or("-"),
        issue.title
    );
    if !detailed {
        return;
    }

    println!(
        "         last activity: {}",
        issue.last_activity.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ref worktree) = issue.worktree {
        println!("         worktree: {}", worktree.display());
    }
    if let Some(ref branch) = issue.branch {
        println!("         branch: {}", branch);
    }
    if let Some(ref pr) = issue.pr {
        println!("         PR #{}: {}", pr.number, pr.url);
    }
    if let Some(ql) = issue.quality_loop
        && ql.enabled
    {
        println!(
            "         quality loop: iteration {}/{}",
            ql.current_iteration, ql.max_iterations
        );
    }
    for (name, phase) in &issue.phases {
        let line = format!("  [{}] {} ({})", phase_marker(phase.status), name, phase.status);
        match phase.error {
            Some(ref error) => println!("       {}  {}", line, style(error).red()),
            None => println!("       {}", line),
        }
    }
    if let Some(ref criteria) = issue.acceptance_criteria {
        let s = criteria.summary();
        println!(
            "         criteria: {}/{} met, {} not met, {} blocked, {} pending",
            s.met, s.total, s.not_met, s.blocked, s.pending
        );
    }
}

/// Print one issue in detail, or every issue as a table.
///
/// A state document that fails to load is an error, never shown as empty.
pub fn cmd_status(config: &Config, issue: Option<u64>, json: bool) -> Result<()> {
    let mut store = StateStore::new(&config.state_file);
    let state = store.get_state()?;

    if let Some(number) = issue {
        let record = state
            .issue(number)
            .ok_or_else(|| anyhow::anyhow!("Issue #{} is not tracked", number))?;
        if json {
            println!("{}", serde_json::to_string_pretty(record)?);
        } else {
            print_issue(record, true);
        }
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }

    if state.issues.is_empty() {
        println!("No issues tracked yet. Run 'conductor run <ISSUE>...' to start.");
        return Ok(());
    }

    println!();
    println!(
        "{:<7} {:<16} {:<12} Title",
        "Issue", "Status", "Phase"
    );
    println!(
        "{:<7} {:<16} {:<12} -----",
        "-------", "----------------", "------------"
    );
    for record in state.issues.values() {
        print_issue(record, false);
    }
    println!();
    println!(
        "{} issue(s), last updated {}",
        state.issues.len(),
        state.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}
