//! Tracing subscriber setup.
//!
//! Console output is filtered by `RUST_LOG` when set, otherwise by the
//! configured level. When a log directory is configured, `ERROR` events are
//! also appended to `<log_dir>/errors.log` through a non-blocking writer.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// File name of the error log inside the log directory.
pub const ERROR_LOG_FILE: &str = "errors.log";

/// Builds the console filter: `RUST_LOG` wins over `default_level`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the error-log writer.
pub fn init(level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let console = fmt::layer().with_writer(std::io::stderr);

    let (error_file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, ERROR_LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::ERROR);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console.with_filter(env_filter(level)))
        .with(error_file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
