//! procpool - run jobs on a supervised pool of worker processes

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{
    OwoColorize,
    Stream::{Stderr, Stdout},
};
use procpool::logging::{self, LogConfig};
use procpool::tasks::builtin_registry;
use procpool::{
    ExecCommand, Job, JobError, JobResult, PoolConfig, TaskPool, Ticker, WorkerRuntime,
    WorkerSetup, run_worker_main,
};
use serde_json::json;
use std::sync::mpsc;

use cli::{Cli, Commands, OutputFormat, RunArgs};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Run(args) => {
            init_logging(&cli);
            cmd_run(args)
        }
        // stdout carries the worker protocol from here on.
        Commands::Worker => run_worker_main(WorkerRuntime::new(builtin_registry())),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::from_verbosity(cli.verbose, cli.quiet).with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    logging::init(config);
}

/// Build the pool configuration: environment first, then explicit flags.
fn pool_config(args: &RunArgs) -> PoolConfig {
    let mut config = PoolConfig::default().with_env_overrides();
    config.processes = args.processes;
    config.maintenance_interval = args.maintenance_interval;
    if let Some(soft) = args.soft_timeout {
        config.soft_timeout = Some(soft);
    }
    if let Some(hard) = args.hard_timeout {
        config.hard_timeout = Some(hard);
    }
    if let Some(max) = args.max_tasks {
        config.max_tasks_per_worker = Some(max);
    }
    config
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let setup = WorkerSetup::Exec(ExecCommand::current_exe()?.arg("worker"));
    let pool = TaskPool::new(pool_config(args), setup).context("Invalid pool configuration")?;
    pool.start().context("Failed to start worker pool")?;
    let ticker = Ticker::spawn(pool.timers())?;

    let (tx, rx) = mpsc::channel::<(usize, JobResult)>();
    for index in 0..args.jobs {
        let tx = tx.clone();
        pool.submit(Job::new(&args.task, args.args.clone()), move |outcome| {
            let _ = tx.send((index, outcome));
        })
        .with_context(|| format!("Failed to submit job {}", index))?;
    }
    drop(tx);

    let mut outcomes: Vec<(usize, JobResult)> = rx.iter().take(args.jobs).collect();
    outcomes.sort_by_key(|(index, _)| *index);

    drop(ticker);
    pool.stop().context("Failed to stop worker pool")?;

    let failures = outcomes.iter().filter(|(_, o)| o.is_err()).count();
    for (index, outcome) in &outcomes {
        print_outcome(args.format, *index, outcome);
    }

    if failures > 0 {
        bail!("{} of {} jobs failed", failures, args.jobs);
    }
    Ok(())
}

fn print_outcome(format: OutputFormat, index: usize, outcome: &JobResult) {
    match format {
        OutputFormat::Json => {
            let line = match outcome {
                Ok(value) => json!({ "job": index, "ok": true, "value": value }),
                Err(e) => json!({ "job": index, "ok": false, "error": e.to_string(), "kind": error_kind(e) }),
            };
            println!("{}", line);
        }
        OutputFormat::Plain => match outcome {
            Ok(value) => println!(
                "job {}: {} {}",
                index,
                "ok".if_supports_color(Stdout, |text| text.green()),
                value
            ),
            Err(e) => println!(
                "job {}: {} {}",
                index,
                "failed".if_supports_color(Stdout, |text| text.red()),
                e
            ),
        },
    }
}

fn error_kind(error: &JobError) -> &'static str {
    match error {
        JobError::Task(_) => "task",
        JobError::WorkerDied { .. } => "worker_died",
        JobError::HardTimeout { .. } => "hard_timeout",
        JobError::PoolTerminated => "pool_terminated",
    }
}
