//! Clap derive structures for the `secsgate` CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// secsgate -- connection gateway for SECS/GEM equipment fleets
#[derive(Debug, Parser)]
#[command(
    name = "secsgate",
    version,
    about = "Manage fleets of SECS/GEM equipment over HSMS",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "SECSGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Log line format
    #[arg(long, env = "SECSGATE_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

impl GlobalOpts {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(secsgate_config::config_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// One identifier per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load and validate the configuration, then list configured devices
    #[command(alias = "check")]
    Validate(ValidateArgs),

    /// Run the fleet against simulated equipment until interrupted
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Print the effective configuration (defaults, file, and environment merged)
    #[arg(long)]
    pub effective: bool,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Extra simulated tools beyond the configured devices
    #[arg(long, short = 't', default_value = "0", value_parser = clap::value_parser!(u8).range(0..=250))]
    pub tools: u8,

    /// Stop after this long (e.g. "90s", "5m"); runs until Ctrl-C otherwise
    #[arg(long, short = 'd', value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// How often to print the fleet table
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub report_every: Duration,

    /// How often a simulated tool raises an alarm, reports an event, or changes state
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    pub activity_every: Duration,

    /// Override fleet.max_concurrent_connections for the initial batch
    #[arg(long)]
    pub concurrency: Option<usize>,
}
