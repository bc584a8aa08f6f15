//! procpool - a supervised pool of worker processes.
//!
//! Jobs (a registered task name plus JSON arguments) are handed to isolated
//! OS processes, one job per worker at a time. The pool enforces soft and
//! hard time limits, replaces workers that die or reach their job quota, and
//! can be resized, restarted, drained or torn down while running.
//!
//! Workers are normally started by executing a binary that calls
//! [`run_worker_main`] ([`WorkerSetup::Exec`]), usually the host binary
//! itself behind a hidden subcommand. Forking the host process
//! ([`WorkerSetup::Fork`]) is available as an opt-in; see
//! [`worker::spawn`] for when that is safe.

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod tasks;
pub mod worker;

pub use config::{Admission, PoolConfig, SoftTimeoutAction};
pub use error::{JobError, JobResult, PoolError, Result};
pub use pool::{
    Job, JobId, JobState, Lifecycle, PoolInfo, SubmitOptions, TaskPool, Ticker, Timer,
};
pub use worker::{
    ExecCommand, JobContext, KillMode, KillWorker, SignalPolicy, TaskRegistry, TerminationReason,
    WorkerContext, WorkerRuntime, WorkerSetup, run_worker_main,
};
