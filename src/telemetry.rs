//! Tracing subscriber setup for the CLI.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Log file name inside the log directory. The appender adds a date suffix.
pub const LOG_FILE_PREFIX: &str = "conductor.log";

#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions {
    pub verbose: bool,
    /// Emit JSON lines on stderr instead of human-readable output
    pub json: bool,
    /// Directory for the rolling log file. Only used when it already exists.
    pub log_dir: Option<PathBuf>,
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "conductor=debug,info"
    } else {
        "warn"
    }
}

/// Build the filter from `RUST_LOG`, falling back to the verbosity default.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(verbose).into())
}

/// Install the global subscriber.
///
/// Returns the appender guard when file logging is active; keep it alive
/// until the process exits so buffered lines are flushed. Calling this
/// twice is harmless: the second install is ignored.
pub fn init_tracing(options: TelemetryOptions) -> Option<WorkerGuard> {
    let stderr_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(options.verbose))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(options.verbose))
            .boxed()
    };

    let (file_layer, guard) = match options.log_dir.filter(|dir| dir.is_dir()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("conductor=debug,info"))
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
