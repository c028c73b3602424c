use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Full `EnvFilter` directive; replaces the level-derived default.
pub const ENV_LOG_FILTER: &str = "UNDERTOW_LOG_FILTER";
/// Lets websocket and I/O crates log at trace alongside ours.
pub const ENV_TRACE_DEPS: &str = "UNDERTOW_TRACE_DEPS";

const NOISY_DEPENDENCIES: &[&str] = &["tokio_tungstenite", "tungstenite", "mio"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Keeps the non-blocking writer flushing for the life of the process.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = std::env::var(ENV_LOG_FILTER).ok();
    let trace_deps = std::env::var(ENV_TRACE_DEPS)
        .map(|value| value != "0" && !value.is_empty())
        .unwrap_or(false);
    let directive = Directive::resolve(config.level, filter, trace_deps);

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level == LogLevel::Trace);
    tracing_subscriber::registry()
        .with(EnvFilter::new(&directive.filter))
        .with(layer)
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    if directive.capped_dependencies {
        tracing::debug!(
            target = "undertow::telemetry",
            "dependency traces capped at info; set {ENV_TRACE_DEPS}=1 or {ENV_LOG_FILTER} to override"
        );
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct Directive {
    filter: String,
    capped_dependencies: bool,
}

impl Directive {
    fn resolve(level: LogLevel, explicit: Option<String>, trace_deps: bool) -> Self {
        if let Some(filter) = explicit {
            return Self {
                filter,
                capped_dependencies: false,
            };
        }
        let mut filter = match LevelFilter::from(level) {
            LevelFilter::TRACE => "info,undertow=trace".to_string(),
            LevelFilter::DEBUG => "info,undertow=debug".to_string(),
            other => other.to_string().to_lowercase(),
        };
        let capped_dependencies = level == LogLevel::Trace && !trace_deps;
        if capped_dependencies {
            for target in NOISY_DEPENDENCIES {
                filter.push_str(&format!(",{target}=info"));
            }
        }
        Self {
            filter,
            capped_dependencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn trace_caps_dependency_noise_unless_allowed() {
        let capped = Directive::resolve(LogLevel::Trace, None, false);
        assert!(capped.capped_dependencies);
        assert_eq!(
            capped.filter,
            "info,undertow=trace,tokio_tungstenite=info,tungstenite=info,mio=info"
        );

        let open = Directive::resolve(LogLevel::Trace, None, true);
        assert_eq!(open.filter, "info,undertow=trace");
        assert!(!open.capped_dependencies);

        assert_eq!(Directive::resolve(LogLevel::Warn, None, false).filter, "warn");
    }

    #[test_timeout::timeout]
    fn explicit_filter_wins() {
        let directive =
            Directive::resolve(LogLevel::Error, Some("undertow::sync=trace".into()), false);
        assert_eq!(directive.filter, "undertow::sync=trace");
        assert!(!directive.capped_dependencies);
    }
}
