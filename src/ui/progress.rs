use crate::orchestrator::{BatchResult, IssueResult, PhaseEvent, PhaseResult};
use crate::ui::icons::{CHECK, CLOCK, CROSS, RETRY, RUNNING, SKIP};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Terminal UI for a run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Overall bar: one tick per phase across every issue in the run
/// - Activity spinner: the issue/phase currently executing
///
/// In verbose mode the bars are hidden, since the agent's own output is
/// streamed to the terminal, and only the per-phase lines are printed.
pub struct RunUI {
    multi: MultiProgress,
    overall_bar: ProgressBar,
    activity_bar: ProgressBar,
    phases_per_issue: u64,
    verbose: bool,
}

fn bar_style(template: &str, fallback: ProgressStyle) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or(fallback)
}

fn format_duration(secs: f64) -> String {
    let whole = secs.round() as u64;
    if whole >= 60 {
        format!("{}m {}s", whole / 60, whole % 60)
    } else {
        format!("{:.1}s", secs)
    }
}

impl RunUI {
    pub fn new(total_issues: usize, phases_per_issue: usize, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let phases_per_issue = phases_per_issue as u64;
        let total = total_issues as u64 * phases_per_issue;

        let (overall_bar, activity_bar) = if verbose {
            (ProgressBar::hidden(), ProgressBar::hidden())
        } else {
            let overall = multi.add(ProgressBar::new(total));
            overall.set_style(
                bar_style(
                    "{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                    ProgressStyle::default_bar(),
                )
                .progress_chars("█▓▒░"),
            );
            overall.set_prefix("Phases");

            let activity = multi.add(ProgressBar::new_spinner());
            activity.set_style(bar_style(
                "{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}",
                ProgressStyle::default_spinner(),
            ));
            activity.set_prefix("   Now");
            (overall, activity)
        };

        Self {
            multi,
            overall_bar,
            activity_bar,
            phases_per_issue,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to `eprintln!` if the terminal is gone.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.verbose || self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Route an engine event to the matching display update.
    pub fn handle(&self, event: &PhaseEvent) {
        match event {
            PhaseEvent::IssueStarted { issue } => self.issue_started(*issue),
            PhaseEvent::PhaseStarted {
                issue,
                phase,
                attempt,
            } => self.phase_started(*issue, phase, *attempt),
            PhaseEvent::PhaseCompleted { issue, result } => self.phase_completed(*issue, result),
            PhaseEvent::IssueCompleted { result, .. } => self.issue_completed(result),
        }
    }

    pub fn issue_started(&self, issue: u64) {
        self.print_line(format!(
            "{} {}",
            RUNNING,
            style(format!("Issue #{}", issue)).bold()
        ));
    }

    pub fn phase_started(&self, issue: u64, phase: &str, attempt: u32) {
        if attempt > 1 {
            self.print_line(format!(
                "    {} #{} {} attempt {}",
                RETRY,
                issue,
                style(phase).yellow(),
                attempt
            ));
        }
        self.activity_bar
            .set_message(format!("#{} {}", issue, style(phase).yellow()));
        self.activity_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    pub fn phase_completed(&self, issue: u64, result: &PhaseResult) {
        let elapsed = format_duration(result.duration_seconds);
        if result.success {
            self.print_line(format!(
                "    {} #{} {} {}",
                CHECK,
                issue,
                result.phase,
                style(elapsed).dim()
            ));
            self.overall_bar.inc(1);
        } else {
            let reason = result.reason().unwrap_or_else(|| "failed".to_string());
            self.print_line(format!(
                "    {} #{} {} {} {}",
                CROSS,
                issue,
                result.phase,
                style(reason).red(),
                style(elapsed).dim()
            ));
        }
    }

    pub fn issue_completed(&self, result: &IssueResult) {
        // Phases never reached after a failure still close out their share of the bar.
        let passed = result.phase_results.iter().filter(|r| r.success).count() as u64;
        if passed < self.phases_per_issue {
            self.overall_bar.inc(self.phases_per_issue - passed);
        }

        let label = format!("Issue #{}", result.issue);
        let elapsed = format_duration(result.duration_seconds);
        if result.success {
            self.print_line(format!(
                "{} {} {}",
                CHECK,
                style(label).green().bold(),
                style(elapsed).dim()
            ));
        } else {
            self.print_line(format!(
                "{} {} {}",
                CROSS,
                style(label).red().bold(),
                style(elapsed).dim()
            ));
        }
    }

    /// Stop the bars and print the run summary.
    pub fn finish(&self, batch: &BatchResult, dry_run: bool) {
        self.activity_bar.finish_and_clear();
        self.overall_bar.finish_and_clear();

        let passed = batch.results.iter().filter(|r| r.success).count();
        let failed = batch.results.len() - passed;
        let total_secs: f64 = batch.results.iter().map(|r| r.duration_seconds).sum();

        let mode = if dry_run { " (dry run)" } else { "" };
        eprintln!();
        eprintln!(
            "{}Run finished{}: {} passed, {} failed, {} skipped {}",
            CLOCK,
            mode,
            style(passed).green(),
            style(failed).red(),
            batch.skipped.len(),
            style(format_duration(total_secs)).dim()
        );
        for issue in &batch.skipped {
            eprintln!("  {} Issue #{} not started", SKIP, issue);
        }
    }
}
