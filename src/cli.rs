//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Health scoring and kill-switch evaluation for operational state files
#[derive(Parser, Debug)]
#[command(name = "ops-health")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OPS_HEALTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "OPS_HEALTH_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format (text, json); overrides the config file
    #[arg(long, env = "OPS_HEALTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the kill switch against a state file and print the signal (JSON)
    Evaluate {
        /// Path to subject state (JSON)
        #[arg(short, long)]
        state: PathBuf,

        /// Evaluation time in milliseconds (defaults to the system clock)
        #[arg(long)]
        now: Option<i64>,

        /// Write the pruned / latched state back to the state file
        #[arg(long)]
        write_back: bool,
    },

    /// Score a state file without modifying it and print the breakdown (JSON)
    Score {
        /// Path to subject state (JSON)
        #[arg(short, long)]
        state: PathBuf,

        /// Evaluation time in milliseconds (defaults to the system clock)
        #[arg(long)]
        now: Option<i64>,
    },

    /// Validate the effective policy and print it (YAML)
    Policy,
}
