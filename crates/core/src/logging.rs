use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "trellis";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// `-v` occurrences from the CLI; bumps the default filter to debug /
    /// trace.
    pub verbose: u8,
    /// Explicit filter directive, wins over `verbose` and `RUST_LOG`.
    pub log_filter: Option<String>,
    /// When set, also write daily-rotated log files into this directory.
    pub log_dir: Option<PathBuf>,
}

/// Filter resolution order: explicit CLI filter, then `RUST_LOG`, then a
/// default scaled by verbosity.
pub fn resolve_log_filter(options: &LoggingOptions, rust_log_env: Option<&str>) -> String {
    if let Some(filter) = &options.log_filter {
        return filter.clone();
    }

    if let Some(env_filter) = rust_log_env.filter(|f| !f.trim().is_empty()) {
        return env_filter.to_string();
    }

    match options.verbose {
        0 => DEFAULT_LOG_FILTER.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global tracing subscriber. Returns the file sink's worker
/// guard, which must be held for the life of the process when file logging
/// is enabled.
pub fn init_logging(options: &LoggingOptions) -> Option<WorkerGuard> {
    let filter = resolve_log_filter(options, std::env::var("RUST_LOG").ok().as_deref());
    let env_filter = EnvFilter::try_new(&filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);

    match &options.log_dir {
        Some(log_dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
                .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
                .build(log_dir);

            match appender {
                Ok(appender) => {
                    let (file_writer, guard) = tracing_appender::non_blocking(appender);
                    let file_layer = tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(file_writer);

                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(console_layer)
                        .with(file_layer)
                        .init();
                    Some(guard)
                }
                Err(err) => {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(console_layer)
                        .init();
                    tracing::warn!(
                        error = %err,
                        log_dir = %log_dir.display(),
                        "failed to open log directory, file logging disabled"
                    );
                    None
                }
            }
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(verbose: u8, log_filter: Option<&str>) -> LoggingOptions {
        LoggingOptions {
            verbose,
            log_filter: log_filter.map(str::to_string),
            log_dir: None,
        }
    }

    #[test]
    fn test_explicit_filter_wins() {
        let resolved = resolve_log_filter(
            &options(2, Some("trellis_core=debug")),
            Some("warn"),
        );
        assert_eq!(resolved, "trellis_core=debug");
    }

    #[test]
    fn test_rust_log_wins_over_verbosity() {
        let resolved = resolve_log_filter(&options(1, None), Some("warn"));
        assert_eq!(resolved, "warn");
    }

    #[test]
    fn test_blank_rust_log_is_ignored() {
        let resolved = resolve_log_filter(&options(0, None), Some("  "));
        assert_eq!(resolved, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_verbosity_scales_default() {
        assert_eq!(resolve_log_filter(&options(0, None), None), "info");
        assert_eq!(resolve_log_filter(&options(1, None), None), "debug");
        assert_eq!(resolve_log_filter(&options(3, None), None), "trace");
    }
}
