//! Code that runs inside a worker process.
//!
//! A worker applies its [`SignalPolicy`], runs the host initializer once,
//! announces itself ready and then serves `run` requests from its inbound
//! pipe until it receives `exit` or the pipe closes.
//!
//! In fork mode the parent calls [`WorkerRuntime::serve`] in the child right
//! after `fork(2)`. In exec mode the re-executed binary calls
//! [`run_worker_main`], which serves over stdin/stdout.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{self, SignalPolicy};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable carrying the worker id to exec-mode workers.
pub const ENV_WORKER_ID: &str = "PROCPOOL_WORKER_ID";

/// Context handed to the initializer.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    /// Pool-assigned worker id (absent if an exec-mode worker was started by hand).
    pub worker_id: Option<usize>,
    pub pid: i32,
}

/// Context handed to a task while it runs.
#[derive(Debug, Clone, Copy)]
pub struct JobContext {
    pub job_id: u64,
    pub worker_id: Option<usize>,
}

impl JobContext {
    /// True once the pool asked this job to stop (soft timeout or
    /// `terminate_job` with the cancellation signal).
    ///
    /// Long-running tasks should poll this and bail out with an error.
    pub fn is_cancelled(&self) -> bool {
        signals::cancel_requested()
    }
}

/// A registered task body.
pub type TaskFn = Arc<dyn Fn(&JobContext, Value) -> anyhow::Result<Value> + Send + Sync>;

/// Host-supplied per-process initializer.
pub type Initializer = Arc<dyn Fn(&WorkerContext) -> anyhow::Result<()> + Send + Sync>;

/// Named task bodies a worker can run.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, task: F) -> &mut Self
    where
        F: Fn(&JobContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(task));
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, task: F) -> Self
    where
        F: Fn(&JobContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, task);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskFn> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything a worker process needs to serve jobs.
pub struct WorkerRuntime {
    registry: TaskRegistry,
    initializer: Option<Initializer>,
    signals: SignalPolicy,
    initialized: AtomicBool,
}

impl WorkerRuntime {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry,
            initializer: None,
            signals: SignalPolicy::default(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_initializer<F>(mut self, init: F) -> Self
    where
        F: Fn(&WorkerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(init));
        self
    }

    pub fn with_signal_policy(mut self, signals: SignalPolicy) -> Self {
        self.signals = signals;
        self
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn signal_policy(&self) -> &SignalPolicy {
        &self.signals
    }

    /// Run the initializer unless it already ran in this runtime.
    ///
    /// Returns `Ok(false)` when skipped.
    pub fn initialize(&self, ctx: &WorkerContext) -> anyhow::Result<bool> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        if let Some(init) = &self.initializer {
            init(ctx)?;
        }
        Ok(true)
    }

    /// Worker startup and main loop. Returns the process exit code.
    pub fn serve(&self, worker_id: Option<usize>, reader: PipeFd, writer: PipeFd) -> i32 {
        let mut reader = LineReader::new(reader);
        let mut writer = LineWriter::new(writer);
        let pid = std::process::id() as i32;
        let ctx = WorkerContext { worker_id, pid };

        if let Err(e) = self.startup(&ctx) {
            let resp = WorkResponse::InitFailed {
                message: format!("{:#}", e),
            };
            let _ = writer.write_line(&resp.to_line());
            return 1;
        }

        if writer
            .write_line(&WorkResponse::Ready { pid }.to_line())
            .is_err()
        {
            return 1;
        }

        match self.worker_loop(worker_id, &mut reader, &mut writer) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }

    fn startup(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        // Broken pipes are reported through io::Error.
        // Safety: SIG_IGN has no handler body.
        unsafe {
            nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            )
        }?;
        self.signals.apply()?;
        self.initialize(ctx)?;
        signals::install_cancel_handler()?;
        Ok(())
    }

    /// Reads requests, runs them, writes responses.
    fn worker_loop(
        &self,
        worker_id: Option<usize>,
        reader: &mut LineReader,
        writer: &mut LineWriter,
    ) -> io::Result<()> {
        loop {
            let line = match reader.read_line()? {
                Some(line) => line.to_string(),
                None => return Ok(()),
            };

            let request = match WorkRequest::from_line(&line) {
                Ok(req) => req,
                Err(e) => {
                    let resp = WorkResponse::error(None, format!("Invalid request: {}", e));
                    writer.write_line(&resp.to_line())?;
                    continue;
                }
            };

            match request {
                WorkRequest::Exit => return Ok(()),
                WorkRequest::Run { job_id, task, args } => {
                    let ctx = JobContext { job_id, worker_id };
                    let response = self.run_task(&ctx, &task, args);
                    writer.write_line(&response.to_line())?;
                }
            }
        }
    }

    fn run_task(&self, ctx: &JobContext, task: &str, args: Value) -> WorkResponse {
        let Some(body) = self.registry.get(task) else {
            return WorkResponse::error(Some(ctx.job_id), format!("Unknown task: '{}'", task));
        };

        signals::clear_cancel();
        match catch_unwind(AssertUnwindSafe(|| body(ctx, args))) {
            Ok(Ok(value)) => WorkResponse::result(ctx.job_id, value),
            Ok(Err(e)) => WorkResponse::error(Some(ctx.job_id), format!("{:#}", e)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                WorkResponse::error(Some(ctx.job_id), format!("panic: {}", message))
            }
        }
    }
}

/// Run an exec-mode worker over stdin/stdout.
///
/// Signal policy and worker id are taken from the environment set by the
/// parent. This function never returns.
pub fn run_worker_main(runtime: WorkerRuntime) -> ! {
    let runtime = match SignalPolicy::from_env() {
        Ok(policy) => runtime.with_signal_policy(policy),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    };
    let worker_id = std::env::var(ENV_WORKER_ID)
        .ok()
        .and_then(|v| v.parse().ok());

    // Safety: descriptors 0 and 1 are always open in a spawned worker and
    // nothing else in this process uses them once we take ownership.
    let (stdin_fd, stdout_fd) = unsafe { (OwnedFd::from_raw_fd(0), OwnedFd::from_raw_fd(1)) };

    let code = runtime.serve(worker_id, PipeFd::new(stdin_fd), PipeFd::new(stdout_fd));
    std::process::exit(code);
}
