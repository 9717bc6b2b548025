//! Command-line front end for runstash
//!
//! Loads an optional TOML file into [`config::AppConfig`], applies flag
//! overrides, then runs one subcommand against a [`runstash_store::RunStore`].

pub mod commands;
pub mod config;

pub use config::{AppConfig, Cli, Command};
