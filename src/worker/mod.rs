//! Worker processes: spawning, IPC, signals and the in-process runtime.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Parent Process │
//!                     │    (TaskPool)   │
//!                     └────────┬────────┘
//!                   run/exit   │   ready/result/error
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Each worker owns two pipes carrying newline-delimited JSON
//! ([`protocol`]). The parent keeps the write end of the request pipe in the
//! [`WorkerHandle`] and hands the read end of the response pipe to a reader
//! thread.

pub mod handle;
pub mod ipc;
pub mod kill;
pub mod proc;
pub mod protocol;
pub mod runtime;
pub mod signals;
pub mod spawn;

pub use handle::{WorkerHandle, WorkerStatus};
pub use kill::{DirectKill, KillMode, KillWorker, ProcessTreeKill};
pub use protocol::{WorkRequest, WorkResponse};
pub use runtime::{
    Initializer, JobContext, TaskFn, TaskRegistry, WorkerContext, WorkerRuntime, run_worker_main,
};
pub use signals::{CANCEL_SIGNAL, SignalPolicy, TerminationReason};
pub use spawn::{ExecCommand, ForkSpawner, Spawner, WorkerSetup};
