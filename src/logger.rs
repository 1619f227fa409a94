use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::config::Settings;

/// Target used by audit records so they can be routed to their own file.
pub const AUDIT_TARGET: &str = "sidechannel::audit";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub(crate) log_level: String,
    pub(crate) log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.log_level.clone(), settings.log_dir.clone())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None)
    }
}

/// Keeps the non-blocking file writers alive. Drop it only at exit, or the
/// tail of the log is lost.
#[must_use = "logs stop being flushed once the guard is dropped"]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// - stdout gets a human readable fmt layer filtered by `log_level`.
/// - with a log directory, a daily-rolling `sidechannel.log` gets the same
///   events and a daily-rolling `audit.json` gets one json line per audit
///   record.
pub fn init_tracing(config: &LogConfig) -> Result<LogGuard> {
    let stdout_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(&config.log_level));

    let mut guards = Vec::new();
    let file_layers = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory {}", dir.display()))?;

            let (txt_writer, txt_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, "sidechannel.log"));
            let txt_layer = fmt::layer()
                .with_writer(txt_writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(&config.log_level));

            let (json_writer, json_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, dir, "audit.json"));
            let json_layer = fmt::layer()
                .json()
                .with_writer(json_writer)
                .with_target(true)
                .with_filter(EnvFilter::new(format!("{AUDIT_TARGET}=info")));

            guards.push(txt_guard);
            guards.push(json_guard);
            Some(txt_layer.and_then(json_layer))
        }
        None => None,
    };

    Registry::default()
        .with(stdout_layer)
        .with(file_layers)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LogGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_follows_settings() {
        let settings = Settings {
            log_level: "debug".into(),
            log_dir: Some(PathBuf::from("/tmp/sc-logs")),
            ..Settings::default()
        };
        let config = LogConfig::from_settings(&settings);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/sc-logs")));
        assert_eq!(LogConfig::default().log_level, "info");
    }

    #[test]
    fn second_install_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::new("warn", Some(dir.path().join("logs")));
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        // another test may have installed a subscriber first; either way the
        // second call must fail cleanly
        assert!(second.is_err());
        drop(first);
        assert!(dir.path().join("logs").is_dir());
    }
}
