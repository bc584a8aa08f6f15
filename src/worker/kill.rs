//! Signal delivery to worker processes.
//!
//! Every place that signals a worker (job cancellation, soft/hard timeouts,
//! forced termination) goes through [`KillWorker`]. The implementation is
//! chosen once from [`KillMode`] when the pool is built.

use crate::error::Result;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Capability to deliver a signal to one worker.
pub trait KillWorker: Send + Sync {
    /// Deliver `signal` to the worker process `pid`.
    ///
    /// Signalling a process that already exited is not an error.
    fn kill_worker(&self, pid: Pid, signal: Signal) -> Result<()>;
}

/// Which [`KillWorker`] implementation the pool uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillMode {
    /// Signal only the worker process itself.
    Direct,
    /// Signal the worker's whole process group, reaching anything it spawned.
    #[default]
    ProcessTree,
}

impl KillMode {
    pub fn killer(self) -> Box<dyn KillWorker> {
        match self {
            Self::Direct => Box::new(DirectKill),
            Self::ProcessTree => Box::new(ProcessTreeKill),
        }
    }
}

/// `kill(2)` on the worker pid.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectKill;

impl KillWorker for DirectKill {
    fn kill_worker(&self, pid: Pid, signal: Signal) -> Result<()> {
        match signal::kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `killpg(2)` on the worker's process group.
///
/// Workers are placed in their own group at spawn (group id == pid), so this
/// reaches the worker and every descendant that did not move groups. Falls
/// back to a direct kill if the group no longer exists but the pid does.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTreeKill;

impl KillWorker for ProcessTreeKill {
    fn kill_worker(&self, pid: Pid, signal: Signal) -> Result<()> {
        match signal::killpg(pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => DirectKill.kill_worker(pid, signal),
            Err(e) => Err(e.into()),
        }
    }
}
