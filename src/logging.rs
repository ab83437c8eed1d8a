//! Logging setup for the relay using tracing.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "info,autsys_relay=debug";

/// Initialize logging with file appender and console output.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// stops the file writer.
pub fn init(config: &LoggingConfig) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = resolve_log_dir(config)?;
    std::fs::create_dir_all(&log_dir)?;

    // Create file appender with rotation
    let file_appender = tracing_appender::rolling::daily(&log_dir, "autsys-relay.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = config.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Log directory: {}", log_dir.display());

    Ok((guard, log_dir))
}

/// Configured log directory, or the per-user default.
pub fn resolve_log_dir(config: &LoggingConfig) -> Result<PathBuf> {
    match &config.dir {
        Some(dir) => Ok(dir.clone()),
        None => get_log_dir(),
    }
}

/// Get the log directory path.
fn get_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "autsys", "autsys-relay")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_to_configured_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            dir: Some(temp_dir.path().join("logs")),
            filter: Some("warn".to_string()),
        };

        // Another test may already own the global subscriber.
        if let Ok((_guard, dir)) = init(&config) {
            assert_eq!(dir, temp_dir.path().join("logs"));
        }
        assert!(temp_dir.path().join("logs").is_dir());
    }
}
