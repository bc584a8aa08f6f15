//! Pool configuration.
//!
//! # Environment Variables
//!
//! [`PoolConfig::with_env_overrides`] reads:
//!
//! - `PROCPOOL_PROCESSES` - Number of worker processes
//! - `PROCPOOL_SOFT_TIMEOUT` - Default soft timeout in seconds (fractions allowed)
//! - `PROCPOOL_HARD_TIMEOUT` - Default hard timeout in seconds (fractions allowed)
//! - `PROCPOOL_MAX_TASKS_PER_WORKER` - Recycle a worker after this many jobs
//! - `PROCPOOL_MAINTENANCE_INTERVAL` - Maintenance tick interval in seconds

use crate::error::{PoolError, Result};
use crate::worker::KillMode;
use crate::worker::signals::CANCEL_SIGNAL;
use nix::sys::signal::Signal;
use std::time::Duration;

/// Default interval between maintenance ticks.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a worker gets to report ready.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a stopping worker gets to exit after the exit request.
pub const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How submissions behave when every worker is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Admission {
    /// Queue the job until a worker frees up.
    #[default]
    Unbounded,
    /// Reject with [`PoolError::Backpressure`] immediately.
    FailFast,
    /// Block the caller until a slot frees up, giving up after `timeout`
    /// (or never, if `None`).
    Block { timeout: Option<Duration> },
}

impl Admission {
    /// Whether submissions are limited to the number of worker slots.
    pub fn is_bounded(&self) -> bool {
        !matches!(self, Self::Unbounded)
    }
}

/// What the pool does when a job crosses its soft timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftTimeoutAction {
    /// Deliver a signal to the worker running the job.
    Signal(Signal),
    /// Only flag the job.
    Ignore,
}

impl Default for SoftTimeoutAction {
    fn default() -> Self {
        Self::Signal(CANCEL_SIGNAL)
    }
}

/// Configuration for a [`TaskPool`](crate::TaskPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of worker processes.
    pub processes: usize,
    /// Default soft timeout for jobs that do not set their own.
    pub soft_timeout: Option<Duration>,
    /// Default hard timeout for jobs that do not set their own.
    pub hard_timeout: Option<Duration>,
    /// Replace a worker after it completed this many jobs.
    pub max_tasks_per_worker: Option<usize>,
    pub admission: Admission,
    /// Grace period for a new worker to report ready.
    pub startup_timeout: Duration,
    /// Upper bound on how long `stop` waits for in-flight jobs.
    pub stop_timeout: Option<Duration>,
    /// Interval of the maintenance timer returned by `timers()`.
    pub maintenance_interval: Duration,
    pub kill_mode: KillMode,
    pub soft_timeout_action: SoftTimeoutAction,
    /// Signal used to kill a worker whose job crossed its hard timeout.
    pub hard_timeout_signal: Signal,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            soft_timeout: None,
            hard_timeout: None,
            max_tasks_per_worker: None,
            admission: Admission::Unbounded,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_timeout: None,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            kill_mode: KillMode::default(),
            soft_timeout_action: SoftTimeoutAction::default(),
            hard_timeout_signal: Signal::SIGKILL,
        }
    }
}

impl PoolConfig {
    pub fn new(processes: usize) -> Self {
        Self {
            processes,
            ..Self::default()
        }
    }

    pub fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }

    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout);
        self
    }

    pub fn with_max_tasks_per_worker(mut self, max: usize) -> Self {
        self.max_tasks_per_worker = Some(max);
        self
    }

    pub fn with_admission(mut self, admission: Admission) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_kill_mode(mut self, mode: KillMode) -> Self {
        self.kill_mode = mode;
        self
    }

    pub fn with_soft_timeout_action(mut self, action: SoftTimeoutAction) -> Self {
        self.soft_timeout_action = action;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("PROCPOOL_PROCESSES") {
            self.processes = n;
        }
        if let Some(t) = env_seconds("PROCPOOL_SOFT_TIMEOUT") {
            self.soft_timeout = Some(t);
        }
        if let Some(t) = env_seconds("PROCPOOL_HARD_TIMEOUT") {
            self.hard_timeout = Some(t);
        }
        if let Some(n) = env_parse::<usize>("PROCPOOL_MAX_TASKS_PER_WORKER") {
            self.max_tasks_per_worker = Some(n);
        }
        if let Some(t) = env_seconds("PROCPOOL_MAINTENANCE_INTERVAL") {
            self.maintenance_interval = t;
        }
        self
    }

    /// Check invariants the pool relies on.
    pub fn validate(&self) -> Result<()> {
        validate_timeouts(self.soft_timeout, self.hard_timeout)?;
        if self.max_tasks_per_worker == Some(0) {
            return Err(PoolError::Config(
                "max_tasks_per_worker must be at least 1".to_string(),
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(PoolError::Config(
                "maintenance_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A soft timeout must be strictly shorter than the hard timeout.
pub fn validate_timeouts(soft: Option<Duration>, hard: Option<Duration>) -> Result<()> {
    if let (Some(soft), Some(hard)) = (soft, hard)
        && soft >= hard
    {
        return Err(PoolError::Config(format!(
            "soft timeout ({:?}) must be less than hard timeout ({:?})",
            soft, hard
        )));
    }
    Ok(())
}

/// Parse a number of seconds, allowing fractions ("2.5").
pub fn parse_seconds(s: &str) -> Option<Duration> {
    let secs: f64 = s.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring unparseable environment override");
            None
        }
    }
}

fn env_seconds(key: &str) -> Option<Duration> {
    let value = std::env::var(key).ok()?;
    let parsed = parse_seconds(&value);
    if parsed.is_none() {
        tracing::warn!(key, value = %value, "Ignoring unparseable environment override");
    }
    parsed
}

fn default_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
