//! The task pool: a supervised set of worker processes running submitted jobs.
//!
//! [`TaskPool`] is the public surface. Internally the work is split across:
//!
//! - [`supervisor`](self::supervisor): lifecycle, spawning, resizing, reaping.
//! - [`dispatch`](self::dispatch): submission, queueing, result collection.
//! - [`timeouts`](self::timeouts): soft and hard time limits.
//! - [`timer`]: periodic maintenance.
//!
//! # Example
//!
//! The host binary doubles as its own worker: started with `worker` it
//! serves jobs, otherwise it runs the pool.
//!
//! ```no_run
//! use procpool::{
//!     ExecCommand, Job, PoolConfig, TaskPool, TaskRegistry, WorkerRuntime, WorkerSetup,
//!     run_worker_main,
//! };
//! use serde_json::json;
//!
//! fn registry() -> TaskRegistry {
//!     TaskRegistry::new().with("add", |_ctx, args| {
//!         Ok(json!(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0)))
//!     })
//! }
//!
//! fn main() -> procpool::Result<()> {
//!     if std::env::args().nth(1).as_deref() == Some("worker") {
//!         run_worker_main(WorkerRuntime::new(registry()));
//!     }
//!
//!     let setup = WorkerSetup::Exec(ExecCommand::current_exe()?.arg("worker"));
//!     let pool = TaskPool::new(PoolConfig::new(2), setup)?;
//!     pool.start()?;
//!     pool.submit(Job::new("add", json!([1, 2])), |outcome| {
//!         println!("{:?}", outcome);
//!     })?;
//!     pool.stop()
//! }
//! ```

mod dispatch;
pub mod job;
pub mod state;
mod supervisor;
mod timeouts;
pub mod timer;

pub use job::{Callback, Job, JobId, JobState, SubmitOptions};
pub use state::Lifecycle;
pub use timer::{Ticker, Timer};

use crate::config::PoolConfig;
use crate::error::{JobResult, PoolError, Result};
use crate::worker::{KillWorker, Spawner, WorkerSetup};
use dispatch::Collector;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;
use state::PoolState;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Snapshot of a pool for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    /// Target number of worker processes.
    pub max_concurrency: usize,
    /// Pids of live workers.
    pub processes: Vec<i32>,
    /// Jobs a worker runs before it is replaced, if limited.
    pub max_tasks_per_worker: Option<usize>,
    /// Whether submissions are limited to the number of worker slots.
    pub put_guarded_by_semaphore: bool,
    /// Default (soft, hard) timeouts.
    pub timeouts: (Option<Duration>, Option<Duration>),
}

/// State shared between the facade, the collector and reader threads.
pub(crate) struct PoolInner {
    config: PoolConfig,
    spawner: Box<dyn Spawner>,
    killer: Box<dyn KillWorker>,
    state: Mutex<PoolState>,
    /// Signalled whenever a job is retired, a slot frees up or the lifecycle
    /// changes.
    changed: Condvar,
    collector: Mutex<Option<Collector>>,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A supervised pool of worker processes.
///
/// Dropping the pool terminates it.
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    /// Build a pool. No worker is started until [`start`](Self::start).
    pub fn new(config: PoolConfig, setup: WorkerSetup) -> Result<Self> {
        config.validate()?;
        let spawner = setup.into_spawner();
        let killer = config.kill_mode.killer();
        let state = PoolState::new(config.processes);
        tracing::debug!(
            processes = config.processes,
            mode = spawner.mode(),
            kill_mode = ?config.kill_mode,
            "Created task pool"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                spawner,
                killer,
                state: Mutex::new(state),
                changed: Condvar::new(),
                collector: Mutex::new(None),
            }),
        })
    }

    /// Spawn the configured number of workers and wait until each reports
    /// ready.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Submit a job with the pool's default timeouts.
    ///
    /// `callback` runs exactly once, on the pool's collector thread or on the
    /// thread that shuts the pool down.
    pub fn submit<F>(&self, job: Job, callback: F) -> Result<JobId>
    where
        F: FnOnce(JobResult) + Send + 'static,
    {
        self.inner
            .submit(job, SubmitOptions::default(), Box::new(callback))
    }

    /// Submit a job with its own timeouts.
    pub fn submit_with<F>(&self, job: Job, options: SubmitOptions, callback: F) -> Result<JobId>
    where
        F: FnOnce(JobResult) + Send + 'static,
    {
        self.inner.submit(job, options, Box::new(callback))
    }

    /// Add `n` workers. Returns the new number of serving workers.
    pub fn grow(&self, n: usize) -> Result<usize> {
        self.inner.grow(n)
    }

    /// Retire `n` workers, least recently used first. Returns the number of
    /// serving workers left.
    pub fn shrink(&self, n: usize) -> Result<usize> {
        self.inner.shrink(n)
    }

    /// Replace every worker without dropping below the target capacity.
    pub fn restart(&self) -> Result<()> {
        self.inner.restart()
    }

    /// Stop accepting jobs; in-flight jobs keep running.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Drain in-flight jobs and stop every worker.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    /// Kill every worker now and fail in-flight jobs.
    pub fn terminate(&self) -> Result<()> {
        self.inner.terminate()
    }

    /// Signal a single worker (SIGTERM unless given).
    pub fn terminate_job(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.inner
            .killer
            .kill_worker(pid, signal.unwrap_or(Signal::SIGTERM))
    }

    /// One maintenance pass: timeouts, dead workers, replenishment, queue.
    pub fn maintain(&self) {
        self.inner.maintain();
    }

    /// Apply the soft timeout action to one job now.
    pub fn on_soft_timeout(&self, id: JobId) -> bool {
        self.inner.force_soft_timeout(id)
    }

    /// Kill the job's worker and fail the job with a hard timeout now.
    pub fn on_hard_timeout(&self, id: JobId) -> bool {
        self.inner.force_hard_timeout(id)
    }

    /// Live worker processes.
    pub fn active_process_count(&self) -> usize {
        self.inner.lock_state().live_count()
    }

    /// Jobs accepted and not yet finalized.
    pub fn pending_job_count(&self) -> usize {
        self.inner.lock_state().in_flight()
    }

    /// Default (soft, hard) timeouts.
    pub fn configured_timeouts(&self) -> (Option<Duration>, Option<Duration>) {
        (self.inner.config.soft_timeout, self.inner.config.hard_timeout)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock_state().lifecycle
    }

    /// State of an in-flight job; `None` once it was finalized.
    pub fn job_state(&self, id: JobId) -> Option<JobState> {
        self.inner.lock_state().jobs.get(&id).map(|rec| rec.state)
    }

    pub fn worker_pids(&self) -> Vec<Pid> {
        self.inner.worker_pids()
    }

    /// Whether the last call to `start` brought every worker up.
    pub fn did_start_ok(&self) -> bool {
        self.inner.lock_state().started_ok
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn info(&self) -> PoolInfo {
        let state = self.inner.lock_state();
        PoolInfo {
            max_concurrency: state.target,
            processes: state
                .workers
                .iter()
                .filter(|w| w.status() != crate::worker::WorkerStatus::Doomed)
                .map(|w| w.pid().as_raw())
                .collect(),
            max_tasks_per_worker: self.inner.config.max_tasks_per_worker,
            put_guarded_by_semaphore: self.inner.config.admission.is_bounded(),
            timeouts: self.configured_timeouts(),
        }
    }

    /// Periodic timers the host should drive, e.g. with a [`Ticker`].
    ///
    /// Timers hold only a weak reference; they do nothing once the pool is
    /// dropped.
    pub fn timers(&self) -> Vec<Timer> {
        let weak = Arc::downgrade(&self.inner);
        vec![Timer::new(
            "maintenance",
            self.inner.config.maintenance_interval,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.maintain();
                }
            },
        )]
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("TaskPool")
            .field("lifecycle", &state.lifecycle)
            .field("workers", &state.workers)
            .field("in_flight", &state.in_flight())
            .finish()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        if let Err(e) = self.inner.terminate() {
            tracing::warn!(error = %e, "Failed to terminate pool on drop");
        }
    }
}

pub(crate) fn invalid_state(op: &str, lifecycle: Lifecycle) -> PoolError {
    PoolError::InvalidState(format!("cannot {} a {} pool", op, lifecycle))
}
