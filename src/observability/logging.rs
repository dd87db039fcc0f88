use crate::errors::{HearthError, Result};
use crate::settings::Settings;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Where the daemon writes its rotating logs.
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hearth")
        .join("logs")
}

/// Install the daemon subscriber: a non-blocking, daily-rotated file in
/// `log_dir` (default `~/.hearth/logs/hearthd.log`) plus terse stdout,
/// filtered by `RUST_LOG` or the configured level.
///
/// The returned guard owns the background log writer; the daemon must
/// hold it until exit so buffered lines are flushed on shutdown.
pub fn init_daemon(settings: &Settings, log_dir: Option<PathBuf>) -> Result<WorkerGuard> {
    let dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "hearthd.log"));

    // full detail in the file, a terse human view on the terminal
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);
    let stdout_layer = fmt::layer().compact().with_target(false);

    tracing_subscriber::registry()
        .with(filter_for(&settings.log_level))
        .with(file_layer.and_then(stdout_layer))
        .try_init()
        .map_err(|e| HearthError::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_dir = %dir.display(),
        level = %settings.log_level,
        "log writer started"
    );

    Ok(guard)
}

/// Stdout-only logging for one-shot CLI commands.
pub fn init_cli(level: &str) -> Result<()> {
    fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter_for(level))
        .try_init()
        .map_err(|e| HearthError::Config(format!("logging already initialized: {}", e)))
}

/// `RUST_LOG` wins over the configured level.
fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir_under_home() {
        let dir = default_log_dir();
        assert!(dir.ends_with(".hearth/logs") || dir.ends_with("logs"));
    }
}
