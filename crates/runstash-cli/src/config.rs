use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use runstash_logging::LogConfig;
use runstash_store::StoreConfig;
use serde::{Deserialize, Serialize};

/// Contents of the TOML configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            // Keep one-shot commands quiet unless asked
            log: LogConfig {
                default_level: "warn".into(),
                ..LogConfig::default()
            },
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply command-line overrides on top of the file
    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if cli.dev {
            // Pretty debug console; file output stays as configured
            self.log = LogConfig {
                file: self.log.file.take(),
                ..LogConfig::development()
            };
        }
        if let Some(db) = &cli.db {
            self.store.db_path = db.clone();
        }
        if let Some(level) = &cli.log_level {
            self.log.default_level = level.clone();
        }
        self
    }
}

#[derive(Parser)]
#[command(name = "runstash", about = "Append-only run record store with retention")]
pub struct Cli {
    /// Path to a TOML config file with [store] and [log] tables
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path (overrides the config file)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Human-readable debug logging on stderr
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Append a JSON payload to a run, creating it if needed
    Append {
        run_key: String,
        /// JSON payload, or "-" to read stdin
        payload: String,
    },
    /// Overwrite a run's payload
    Replace {
        run_key: String,
        /// JSON payload, or "-" to read stdin
        payload: String,
    },
    /// Show one run
    Get { run_key: String },
    /// Delete one run
    Delete { run_key: String },
    /// List runs, newest first
    List {
        #[arg(long)]
        run_key: Option<String>,
        /// Only runs created at or after this RFC 3339 time
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// Only runs created at or before this RFC 3339 time
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        #[arg(long, allow_negative_numbers = true)]
        limit: Option<i64>,
        #[arg(long, allow_negative_numbers = true)]
        offset: Option<i64>,
    },
    /// Show record count and creation-time bounds
    Stats,
    /// Run a retention pass now
    Cleanup,
    /// Keep the store open with the sweeper running until ctrl-c
    Serve,
}
