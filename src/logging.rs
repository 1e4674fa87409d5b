//! Tracing subscriber setup.
//!
//! Events go to stderr (pretty or JSON) so that `--json` command output on
//! stdout stays machine-readable. When `[logging] directory` is set, a
//! daily-rolling JSON log file is written alongside.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingSection};

/// Keeps the background log writer alive; drop it last.
#[must_use]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Resolve the active filter: `RUST_LOG` wins, then `--verbose`, then config.
pub fn build_filter(config: &LoggingSection, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = if verbose {
            "labtriage=debug,tower_http=debug"
        } else {
            config.filter.as_str()
        };
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("labtriage=info"))
    })
}

/// Install the global subscriber.
pub fn init_logging(
    config: &LoggingSection,
    verbose: bool,
    log_dir: Option<&Path>,
) -> Result<LogGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);
    layers.push(match config.format {
        LogFormat::Pretty => stderr.boxed(),
        LogFormat::Json => stderr.json().boxed(),
    });

    let mut file_guard = None;
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, "labtriage.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().json().with_writer(writer).boxed());
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(config, verbose))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _file: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_filter_falls_back() {
        let config = LoggingSection {
            filter: "[[[not a filter".to_string(),
            ..LoggingSection::default()
        };
        // Must not panic regardless of RUST_LOG in the test environment.
        let _ = build_filter(&config, false);
    }

    #[test]
    fn test_file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        // A global subscriber may already be installed by another test; the
        // directory must be created either way.
        let _ = init_logging(&LoggingSection::default(), false, Some(&logs));
        assert!(logs.exists());
    }
}
