//! Worker subprocess spawning.
//!
//! Two strategies sit behind [`Spawner`]:
//!
//! - **Exec** (the usual choice): start a program, normally the host binary
//!   itself, via `std::process::Command`. It serves over stdin/stdout by
//!   calling [`run_worker_main`](super::runtime::run_worker_main). The worker
//!   starts from a clean process image.
//! - **Fork** (opt-in): `fork(2)` the current process; the child inherits the
//!   task registry and initializer and serves over a pair of fresh pipes.
//!
//! # Fork hazards
//!
//! The pool forks from its own threads (collector, spawner) while reader
//! threads and whatever threads the host runs are alive. Only the forking
//! thread exists in the child, but every lock is copied in whatever state it
//! had. A lock some other thread held at that instant (a host mutex, stdio,
//! a logging subscriber, a non-glibc allocator) stays locked in the child
//! forever, and the child allocates and runs host code before serving. A
//! worker caught this way hangs: at startup that is a startup timeout, later
//! only a hard timeout gets rid of it. Use fork mode only when the host's
//! other threads do not hold locks the task code needs.
//!
//! Either way the worker is placed in its own process group so the pool can
//! signal its whole tree.

use super::ipc::PipeFd;
use super::proc::Proc;
use super::runtime::{ENV_WORKER_ID, WorkerRuntime};
use super::signals::SignalPolicy;
use crate::error::{PoolError, Result};
use nix::unistd::{ForkResult, Pid, fork, setpgid};
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Creates worker processes for the pool.
pub trait Spawner: Send + Sync {
    /// Start worker `worker_id`. The returned process has not yet completed
    /// its startup handshake.
    fn spawn(&self, worker_id: usize) -> Result<Proc>;

    /// Short name for logging.
    fn mode(&self) -> &'static str;
}

/// How the pool starts its workers.
pub enum WorkerSetup {
    /// Execute a program that calls `run_worker_main`.
    Exec(ExecCommand),
    /// Fork the host process and run `WorkerRuntime` in the child.
    ///
    /// See the [module docs](self) for the hazards of forking a
    /// multi-threaded process.
    Fork(WorkerRuntime),
}

impl WorkerSetup {
    pub(crate) fn into_spawner(self) -> Box<dyn Spawner> {
        match self {
            Self::Exec(command) => Box::new(command),
            Self::Fork(runtime) => Box::new(ForkSpawner::new(runtime)),
        }
    }
}

/// Fork-based spawner.
pub struct ForkSpawner {
    runtime: Arc<WorkerRuntime>,
}

impl ForkSpawner {
    pub fn new(runtime: WorkerRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
        }
    }
}

impl Spawner for ForkSpawner {
    fn spawn(&self, worker_id: usize) -> Result<Proc> {
        let (req_read, req_write) = PipeFd::pair()?;
        let (resp_read, resp_write) = PipeFd::pair()?;

        // Safety: the parent may be multi-threaded, and the child goes on to
        // allocate and run task code, which is not async-signal-safe. This is
        // sound only if no lock the child needs was held by another thread at
        // fork time (see module docs). The child never returns into the
        // parent's stack and leaves through _exit without running its
        // destructors.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                drop(req_read);
                drop(resp_write);
                // Also set from the parent so killpg works before the child
                // gets scheduled. EACCES after exec/ESRCH are harmless.
                let _ = setpgid(child, child);
                Ok(Proc::new(child, req_write, resp_read))
            }
            ForkResult::Child => {
                drop(req_write);
                drop(resp_read);
                let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                let code = self.runtime.serve(Some(worker_id), req_read, resp_write);
                // Safety: terminating the forked child without unwinding or
                // running atexit handlers that belong to the parent.
                unsafe { nix::libc::_exit(code) }
            }
        }
    }

    fn mode(&self) -> &'static str {
        "fork"
    }
}

/// Exec-based spawner: runs a program that serves over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ExecCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    signals: SignalPolicy,
}

impl ExecCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            signals: SignalPolicy::default(),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            PoolError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn signal_policy(mut self, signals: SignalPolicy) -> Self {
        self.signals = signals;
        self
    }

    fn command(&self, worker_id: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        cmd.envs(self.signals.to_env());
        cmd.env(ENV_WORKER_ID, worker_id.to_string());

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Worker errors go to parent's stderr
        cmd.process_group(0);
        cmd
    }
}

impl Spawner for ExecCommand {
    fn spawn(&self, worker_id: usize) -> Result<Proc> {
        let child = self.command(worker_id).spawn().map_err(|e| {
            PoolError::Worker(format!(
                "Failed to spawn worker {} ({}): {}",
                worker_id,
                self.program.display(),
                e
            ))
        })?;
        Proc::from_child(child)
    }

    fn mode(&self) -> &'static str {
        "exec"
    }
}
