//! Structured logging for the gamenet binaries.
//!
//! Console output goes through a human-readable `fmt` layer. When a log
//! directory is configured, a second layer writes JSON lines to
//! `gamenet.log` for later inspection. `RUST_LOG` always wins over the
//! configured level.

use std::path::Path;

use gamenet_config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info,rustls=warn";

/// Name of the JSON log file written inside the log directory.
pub const LOG_FILE_NAME: &str = "gamenet.log";

/// Initialize the global tracing subscriber.
///
/// Sets up:
/// - console output with target, thread name, level and uptime
/// - a JSON file layer under `config.dir`, when set and writable
/// - filtering from `RUST_LOG`, falling back to `config.level`
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
///
/// ```no_run
/// use gamenet_config::LogConfig;
/// use gamenet_log::init_logging;
///
/// init_logging(None);
/// init_logging(Some(&LogConfig::default()));
/// ```
pub fn init_logging(config: Option<&LogConfig>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if let Some(log_dir) = config.and_then(|c| c.dir.as_deref())
        && let Some(log_file) = open_log_file(log_dir)
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        let _ = subscriber.with(file_layer).try_init();
        return;
    }

    let _ = subscriber.try_init();
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn filter_directive(config: Option<&LogConfig>) -> String {
    match config {
        Some(config) if !config.level.trim().is_empty() => config.level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

fn open_log_file(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    std::fs::File::create(log_dir.join(LOG_FILE_NAME)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("rustls=warn"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_configured_level_wins_over_default() {
        let config = LogConfig {
            level: "debug,gamenet_net=trace".to_string(),
            dir: None,
        };
        assert_eq!(filter_directive(Some(&config)), "debug,gamenet_net=trace");
        assert_eq!(filter_directive(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_blank_level_falls_back() {
        let config = LogConfig {
            level: "  ".to_string(),
            dir: None,
        };
        assert_eq!(filter_directive(Some(&config)), DEFAULT_FILTER);
    }

    #[test]
    fn test_env_filter_parsing() {
        for filter_str in ["info", "debug,gamenet_net=trace", "warn,rustls=error", "error"] {
            assert!(
                EnvFilter::try_from(filter_str).is_ok(),
                "Failed to parse filter: {filter_str}"
            );
        }
    }

    #[test]
    fn test_log_file_created_in_nested_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs").join("server");

        assert!(open_log_file(&log_dir).is_some());
        assert!(log_dir.join(LOG_FILE_NAME).exists());
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(None);
        init_logging(Some(&LogConfig::default()));
        tracing::info!("still logging");
    }
}
