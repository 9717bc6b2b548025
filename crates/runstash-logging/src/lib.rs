//! Logging setup for runstash
//!
//! Builds the global tracing subscriber from a [`LogConfig`]: console output
//! in pretty or JSONL form, plus optional JSONL file output with rotation.
//! `RUST_LOG` overrides the configured default level.
//!
//! # Quick Start
//!
//! ```ignore
//! use runstash_logging::{LogConfig, SubscriberBuilder};
//!
//! // JSONL to stderr
//! let _guard = SubscriberBuilder::new().try_init()?;
//!
//! // Development mode with human-readable output
//! let _guard = SubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .try_init()?;
//! ```
//!
//! Keep the returned guard alive for as long as file output should be
//! flushed.

pub mod config;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Failed to open log file: {0}")]
    FileOutput(String),

    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Builder for configuring and initializing the global subscriber
///
/// By default, console output uses JSONL format. Use
/// [`LogConfig::development()`] for human-readable output.
pub struct SubscriberBuilder {
    config: LogConfig,
}

impl SubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Install the subscriber globally
    ///
    /// Returns the file writer guard when file output is configured. Fails
    /// if a global subscriber has already been set.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let filter = build_filter(&self.config)?;
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            let console_layer = if self.config.console.pretty {
                tracing_subscriber::fmt::layer()
                    .with_ansi(self.config.console.ansi)
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .boxed()
            } else {
                json_layer(&self.config.jsonl, std::io::stderr)
            };
            layers.push(console_layer);
        }

        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            layers.push(json_layer(&self.config.jsonl, writer));
            guard = Some(file_guard);
        }

        Registry::default().with(layers).with(filter).try_init()?;
        Ok(guard)
    }
}

impl Default for SubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the level filter: `RUST_LOG` if set, else the configured default,
/// then the extra directives on top
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    let mut filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_level)
            .map_err(|e| LoggingError::InvalidFilter(format!("{}: {e}", config.default_level)))?,
    };

    for raw in &config.directives {
        let directive: Directive = raw
            .parse()
            .map_err(|e| LoggingError::InvalidFilter(format!("{raw}: {e}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

fn json_layer<W>(jsonl: &JsonlConfig, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(jsonl.include_current_span)
        .with_span_list(jsonl.include_spans)
        .flatten_event(jsonl.flatten_events)
        .with_file(jsonl.include_location)
        .with_line_number(jsonl.include_location)
        .with_writer(writer)
        .boxed()
}

fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let rotation = match config.rotation {
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
        RotationStrategy::Never => Rotation::NEVER,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.prefix.as_str())
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }

    let appender = builder
        .build(&config.directory)
        .map_err(|e| LoggingError::FileOutput(format!("{}: {e}", config.directory.display())))?;
    Ok(tracing_appender::non_blocking(appender))
}
