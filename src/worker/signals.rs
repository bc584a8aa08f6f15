//! Signal handling for worker processes.
//!
//! Covers three things: the [`SignalPolicy`] applied once when a worker
//! starts, the cancellation flag raised by the soft-timeout signal, and
//! analysis of how a worker process terminated.

use crate::error::{PoolError, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::WaitStatus;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Signal delivered to a worker to cancel its current job on soft timeout.
pub const CANCEL_SIGNAL: Signal = Signal::SIGUSR1;

/// Environment variable carrying the reset set to exec-mode workers.
pub const ENV_SIGRESET: &str = "PROCPOOL_SIGRESET";

/// Environment variable carrying the ignore set to exec-mode workers.
pub const ENV_SIGIGNORE: &str = "PROCPOOL_SIGIGNORE";

/// Signals a worker resets to their default disposition at startup.
pub const WORKER_SIGRESET: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGUSR1,
];

/// Signals a worker ignores at startup.
pub const WORKER_SIGIGNORE: [Signal; 1] = [Signal::SIGINT];

/// Set by the cancellation handler, cleared before each job.
static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Which signals a freshly started worker resets and which it ignores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPolicy {
    pub reset: Vec<Signal>,
    pub ignore: Vec<Signal>,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            reset: WORKER_SIGRESET.to_vec(),
            ignore: WORKER_SIGIGNORE.to_vec(),
        }
    }
}

impl SignalPolicy {
    /// Build a policy from signal names such as `"SIGTERM"`.
    pub fn from_names<R, I>(reset: R, ignore: I) -> Result<Self>
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Ok(Self {
            reset: parse_signals(reset)?,
            ignore: parse_signals(ignore)?,
        })
    }

    /// Read the policy handed down by the parent, falling back to the default
    /// for any variable that is unset.
    pub fn from_env() -> Result<Self> {
        let mut policy = Self::default();
        if let Ok(value) = std::env::var(ENV_SIGRESET) {
            policy.reset = parse_signals(split_names(&value))?;
        }
        if let Ok(value) = std::env::var(ENV_SIGIGNORE) {
            policy.ignore = parse_signals(split_names(&value))?;
        }
        Ok(policy)
    }

    /// Environment entries that reproduce this policy in an exec-mode worker.
    pub fn to_env(&self) -> [(&'static str, String); 2] {
        [
            (ENV_SIGRESET, join_names(&self.reset)),
            (ENV_SIGIGNORE, join_names(&self.ignore)),
        ]
    }

    /// Apply the policy to the calling process.
    ///
    /// Resetting happens before ignoring, so a signal listed in both ends up
    /// ignored.
    pub fn apply(&self) -> Result<()> {
        for &sig in &self.reset {
            // Safety: installing SIG_DFL does not run any Rust code in
            // signal context.
            unsafe { signal::signal(sig, SigHandler::SigDfl) }?;
        }
        for &sig in &self.ignore {
            // Safety: as above, SIG_IGN has no handler body.
            unsafe { signal::signal(sig, SigHandler::SigIgn) }?;
        }
        Ok(())
    }
}

fn split_names(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn join_names(signals: &[Signal]) -> String {
    signals
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_signals<I>(names: I) -> Result<Vec<Signal>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| {
            let name = name.as_ref();
            Signal::from_str(name)
                .map_err(|_| PoolError::Config(format!("Unknown signal name: '{}'", name)))
        })
        .collect()
}

extern "C" fn on_cancel_signal(_: nix::libc::c_int) {
    CANCEL_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the handler that turns [`CANCEL_SIGNAL`] into a cancellation flag.
pub fn install_cancel_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_cancel_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: the handler only stores to an atomic, which is async-signal-safe.
    unsafe { signal::sigaction(CANCEL_SIGNAL, &action) }?;
    Ok(())
}

/// Whether a cancellation was requested for the current job.
pub fn cancel_requested() -> bool {
    CANCEL_REQUESTED.load(Ordering::SeqCst)
}

/// Clear the cancellation flag before starting a job.
pub fn clear_cancel() {
    CANCEL_REQUESTED.store(false, Ordering::SeqCst);
}

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {}", sig.as_str()),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
