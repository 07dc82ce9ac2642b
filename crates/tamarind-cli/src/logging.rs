//! Console and rolling-file logging for the `tamarind` binary.
//!
//! Console output goes to stderr so command results on stdout stay clean.
//! When file logging is enabled, every event lands in `tamarind.log` and
//! two component files split session and lock traffic:
//!
//! | Log File      | Target Prefixes                                                   |
//! |---------------|-------------------------------------------------------------------|
//! | tamarind.log  | (all)                                                             |
//! | session.log   | tamarind_client::session, tamarind_client::watch, tamarind_client::zk |
//! | lock.log      | tamarind_client::lock, tamarind_client::data                      |
//!
//! Settings come from `TAMARIND_LOG_*` variables; `RUST_LOG` overrides the
//! level filter of the console and root file.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "session.log",
        targets: &[
            "tamarind_client::session",
            "tamarind_client::watch",
            "tamarind_client::zk",
        ],
    },
    ComponentLogDef {
        file_name: "lock.log",
        targets: &["tamarind_client::lock", "tamarind_client::data"],
    },
];

const ROOT_LOG: &str = "tamarind.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

impl LogRotation {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "hourly" => Some(Self::Hourly),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base log directory (default: `~/tamarind/logs`)
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    /// Off by default; a CLI run is usually short-lived
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/tamarind/logs", home))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::WARN,
            file_logging: false,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let log_dir = lookup("TAMARIND_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir);

        let console_output = lookup("TAMARIND_LOG_CONSOLE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(defaults.console_output);

        let file_logging = lookup("TAMARIND_LOG_FILE")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(defaults.file_logging);

        let console_level = lookup("TAMARIND_LOG_LEVEL")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.console_level);

        let file_level = lookup("TAMARIND_LOG_FILE_LEVEL")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.file_level);

        let rotation = lookup("TAMARIND_LOG_ROTATION")
            .and_then(|v| LogRotation::parse(&v))
            .unwrap_or(defaults.rotation);

        Self {
            log_dir,
            console_output,
            console_level,
            file_logging,
            file_level,
            rotation,
        }
    }

    /// Raise the console level to at least `level` (used by `-v`).
    pub fn with_verbosity(mut self, level: Level) -> Self {
        if level > self.console_level {
            self.console_level = level;
        }
        self
    }
}

/// Keeps the non-blocking file writers alive; buffered output is flushed on drop.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        let component_level: LevelFilter = config.file_level.into();
        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, component_level);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::debug!(
            log_dir = %config.log_dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert!(!config.file_logging);
        assert_eq!(config.console_level, Level::WARN);
        assert_eq!(config.rotation, LogRotation::Daily);
        assert!(config.log_dir.ends_with("tamarind/logs"));
    }

    #[test]
    fn test_logging_config_from_env_vars() {
        let config = LoggingConfig::from_lookup(lookup(&[
            ("TAMARIND_LOG_DIR", "/tmp/tamarind-test"),
            ("TAMARIND_LOG_CONSOLE", "0"),
            ("TAMARIND_LOG_FILE", "true"),
            ("TAMARIND_LOG_LEVEL", "debug"),
            ("TAMARIND_LOG_ROTATION", "hourly"),
        ]));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/tamarind-test"));
        assert!(!config.console_output);
        assert!(config.file_logging);
        assert_eq!(config.console_level, Level::DEBUG);
        assert_eq!(config.file_level, Level::INFO);
        assert_eq!(config.rotation, LogRotation::Hourly);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = LoggingConfig::from_lookup(lookup(&[
            ("TAMARIND_LOG_LEVEL", "loud"),
            ("TAMARIND_LOG_ROTATION", "weekly"),
        ]));
        assert_eq!(config.console_level, Level::WARN);
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_verbosity_only_raises() {
        let config = LoggingConfig::default().with_verbosity(Level::DEBUG);
        assert_eq!(config.console_level, Level::DEBUG);

        let config = config.with_verbosity(Level::ERROR);
        assert_eq!(config.console_level, Level::DEBUG);
    }

    #[test]
    fn test_log_rotation_conversion() {
        assert!(matches!(
            Rotation::from(LogRotation::Daily),
            Rotation::DAILY
        ));
        assert!(matches!(
            Rotation::from(LogRotation::Never),
            Rotation::NEVER
        ));
    }

    #[test]
    fn test_component_log_definitions() {
        for component in COMPONENT_LOGS {
            assert!(component.file_name.ends_with(".log"));
            assert!(!component.targets.is_empty());
            assert!(
                component
                    .targets
                    .iter()
                    .all(|t| t.starts_with("tamarind_client::"))
            );
        }
    }
}
