//! Logging for governance node agents
//!
//! This module sets up the global `tracing` subscriber with:
//! - A console layer in pretty, compact or JSON format
//! - An optional rolling log file written through a non-blocking worker
//! - Microsecond timestamps
//! - `RUST_LOG` overrides on top of the configured default level

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{format::Writer, time::FormatTime, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// High-precision timestamp formatter
struct MicrosecondTimestamp;

impl FormatTime for MicrosecondTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:06}",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_micros()
        )
    }
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    Hourly,
    Daily,
    Never,
}

impl RotationPolicy {
    /// Convert to tracing_appender rotation
    fn to_appender_rotation(self) -> Rotation {
        match self {
            RotationPolicy::Hourly => Rotation::HOURLY,
            RotationPolicy::Daily => Rotation::DAILY,
            RotationPolicy::Never => Rotation::NEVER,
        }
    }
}

/// Output format for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Pretty-printed multi-line text
    PrettyConsole,
    /// Single-line text
    Compact,
    /// One JSON object per line
    Json,
}

/// Rolling file output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    /// Directory of the log files
    pub directory: PathBuf,
    /// File name prefix; rotation appends the date
    pub file_name: String,
    /// Level filter of the file output
    pub level: String,
    pub format: OutputFormat,
    pub rotation: RotationPolicy,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name: "govnode.log".to_string(),
            level: "debug".to_string(),
            format: OutputFormat::Json,
            rotation: RotationPolicy::Daily,
        }
    }
}

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level, used when `RUST_LOG` is not set
    pub default_level: String,
    /// Console output format
    pub format: OutputFormat,
    /// Whether to include file and line information
    pub include_file_line: bool,
    /// Whether to include module path
    pub include_module_path: bool,
    /// Whether to include thread ID
    pub include_thread_id: bool,
    /// Rolling file output, disabled when absent
    pub file: Option<FileLogConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            format: OutputFormat::PrettyConsole,
            include_file_line: false,
            include_module_path: true,
            include_thread_id: false,
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Check that every level filter parses
    pub fn validate(&self) -> Result<(), LoggingError> {
        EnvFilter::try_new(&self.default_level)
            .map_err(|e| LoggingError::InvalidFilter(format!("{}: {}", self.default_level, e)))?;
        if let Some(file) = &self.file {
            EnvFilter::try_new(&file.level)
                .map_err(|e| LoggingError::InvalidFilter(format!("{}: {}", file.level, e)))?;
            if file.file_name.is_empty() {
                return Err(LoggingError::InvalidFilter(
                    "Log file name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Keeps the non-blocking file writers alive; drop it at process exit to flush
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Logger setup
pub struct Logger;

impl Logger {
    /// Install the global subscriber
    pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
        config.validate()?;

        let mut guards = Vec::new();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        // Create environment filter
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.default_level));
        layers.push(format_layer(config, config.format, io::stdout, true, env_filter));

        // Configure file output
        if let Some(file) = &config.file {
            std::fs::create_dir_all(&file.directory)?;

            let file_appender = RollingFileAppender::new(
                file.rotation.to_appender_rotation(),
                &file.directory,
                &file.file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            guards.push(guard);

            let file_filter = EnvFilter::new(&file.level);
            layers.push(format_layer(config, file.format, non_blocking, false, file_filter));
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)?;

        Ok(LoggingGuard { _guards: guards })
    }
}

fn format_layer<W>(
    config: &LoggingConfig,
    format: OutputFormat,
    writer: W,
    ansi: bool,
    filter: EnvFilter,
) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_module_path)
        .with_thread_ids(config.include_thread_id)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .with_timer(MicrosecondTimestamp);

    match format {
        OutputFormat::PrettyConsole => layer.pretty().with_filter(filter).boxed(),
        OutputFormat::Compact => layer.compact().with_filter(filter).boxed(),
        OutputFormat::Json => layer.json().with_filter(filter).boxed(),
    }
}

/// Logging error types
#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("Logging system already initialized")]
    AlreadyInitialized,

    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.default_level, "info");
        assert_eq!(config.format, OutputFormat::PrettyConsole);
        assert!(config.file.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: LoggingConfig = serde_json::from_str(
            r#"{"default_level": "govnode_rpc=debug,info", "format": "json", "file": {"rotation": "hourly"}}"#,
        )
        .unwrap();

        assert_eq!(config.format, OutputFormat::Json);
        let file = config.file.as_ref().unwrap();
        assert_eq!(file.rotation, RotationPolicy::Hourly);
        assert_eq!(file.file_name, "govnode.log");
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LoggingConfig {
            default_level: "govnode_rpc=loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LoggingError::InvalidFilter(_))));
    }

    #[test]
    fn test_init_with_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            format: OutputFormat::Compact,
            file: Some(FileLogConfig {
                directory: dir.path().join("logs"),
                rotation: RotationPolicy::Never,
                ..Default::default()
            }),
            ..Default::default()
        };

        let guard = Logger::init(&config).unwrap();
        tracing::info!("logging initialized");
        assert!(dir.path().join("logs").is_dir());

        assert!(matches!(
            Logger::init(&config),
            Err(LoggingError::AlreadyInitialized)
        ));
        drop(guard);
    }
}
