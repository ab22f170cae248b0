//! Command-line interface definitions for the monitor.
//!
//! There are no subcommands: the binary takes the config path as its only
//! argument and runs until killed.

use clap::Parser;

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(default_value = "config.yml")]
    pub config: String,
}
