//! Command-line interface definitions using clap.

use procpool::logging::LogFormat;
use clap::{Parser, Subcommand, ValueEnum};

/// Run jobs on a supervised pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_parser = parse_log_format, global = true)]
    pub log_format: Option<LogFormat>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a pool, run a batch of jobs on it and report each outcome.
    Run(RunArgs),

    /// Serve jobs over stdin/stdout (started by the pool, not by hand).
    #[command(hide = true)]
    Worker,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker processes.
    #[arg(short, long, env = "PROCPOOL_PROCESSES", default_value_t = 2)]
    pub processes: usize,

    /// Number of jobs to submit.
    #[arg(short, long, default_value_t = 1)]
    pub jobs: usize,

    /// Task to run (echo, sleep, fail, exit).
    #[arg(short, long, default_value = "echo")]
    pub task: String,

    /// Task arguments as JSON.
    #[arg(short, long, default_value = "null", value_parser = parse_json)]
    pub args: serde_json::Value,

    /// Soft time limit per job, in seconds.
    #[arg(long, value_parser = parse_seconds)]
    pub soft_timeout: Option<std::time::Duration>,

    /// Hard time limit per job, in seconds.
    #[arg(long, value_parser = parse_seconds)]
    pub hard_timeout: Option<std::time::Duration>,

    /// Replace a worker after it ran this many jobs.
    #[arg(long)]
    pub max_tasks: Option<usize>,

    /// Seconds between maintenance passes.
    #[arg(long, default_value = "0.1", value_parser = parse_seconds)]
    pub maintenance_interval: std::time::Duration,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Plain)]
    pub format: OutputFormat,
}

/// Output format for job outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per job.
    #[default]
    Plain,
    /// One JSON object per job.
    Json,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

fn parse_json(s: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_seconds(s: &str) -> Result<std::time::Duration, String> {
    procpool::config::parse_seconds(s).ok_or_else(|| format!("invalid number of seconds: '{}'", s))
}
