//! Parent-side bookkeeping for one worker process.

use super::proc::Proc;
use super::protocol::WorkRequest;
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::Result;
use nix::unistd::Pid;
use std::time::Instant;

/// Where a worker stands with respect to new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Accepting jobs.
    Ready,
    /// Finishing its current job, then leaving the pool.
    Retiring,
    /// Signalled to die (hard timeout, broken pipe); waiting to be reaped.
    Doomed,
}

/// One worker process as seen by the pool.
pub struct WorkerHandle {
    id: usize,
    proc: Proc,
    status: WorkerStatus,
    /// Job currently running on this worker; a worker runs one job at a time.
    current: Option<u64>,
    tasks_completed: usize,
    last_used: Instant,
}

impl WorkerHandle {
    pub fn new(id: usize, proc: Proc) -> Self {
        let now = Instant::now();
        Self {
            id,
            proc,
            status: WorkerStatus::Ready,
            current: None,
            tasks_completed: 0,
            last_used: now,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.proc.pid()
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn current_job(&self) -> Option<u64> {
        self.current
    }

    pub fn tasks_completed(&self) -> usize {
        self.tasks_completed
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Whether a new job may be handed to this worker right now.
    pub fn accepts_jobs(&self) -> bool {
        self.status == WorkerStatus::Ready && self.current.is_none()
    }

    pub fn retire(&mut self) {
        if self.status == WorkerStatus::Ready {
            self.status = WorkerStatus::Retiring;
        }
    }

    pub fn doom(&mut self) {
        self.status = WorkerStatus::Doomed;
    }

    /// Forward a job to the worker and mark it busy.
    pub fn assign(&mut self, job_id: u64, request: &WorkRequest) -> Result<()> {
        self.proc.send(request)?;
        self.current = Some(job_id);
        self.last_used = Instant::now();
        Ok(())
    }

    /// Clear the current job if it is `job_id`. Returns whether it was.
    pub fn release(&mut self, job_id: u64) -> bool {
        if self.current != Some(job_id) {
            return false;
        }
        self.current = None;
        self.last_used = Instant::now();
        true
    }

    /// Record a finished job on this worker.
    pub fn complete(&mut self, job_id: u64) -> bool {
        let released = self.release(job_id);
        if released {
            self.tasks_completed += 1;
        }
        released
    }

    /// Take the current job without counting it as completed.
    pub fn take_current(&mut self) -> Option<u64> {
        self.current.take()
    }

    /// Non-blocking exit check; `Some` once the process is known to be gone.
    pub fn poll_exit(&mut self) -> Option<TerminationReason> {
        match self.proc.try_wait() {
            Ok(Some(status)) => Some(analyze_wait_status(status)),
            Ok(None) => None,
            // Already reaped elsewhere, or not our child any more.
            Err(_) => Some(TerminationReason::Unknown),
        }
    }

    pub fn into_proc(self) -> Proc {
        self.proc
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("status", &self.status)
            .field("current", &self.current)
            .field("tasks_completed", &self.tasks_completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    fn cat_worker(id: usize) -> WorkerHandle {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");
        WorkerHandle::new(id, Proc::from_child(child).unwrap())
    }

    #[test]
    fn test_assign_and_complete() {
        let mut worker = cat_worker(1);
        assert!(worker.accepts_jobs());

        worker
            .assign(5, &WorkRequest::run(5, "echo", json!(null)))
            .unwrap();
        assert_eq!(worker.current_job(), Some(5));
        assert!(!worker.accepts_jobs());

        assert!(!worker.complete(6));
        assert!(worker.complete(5));
        assert_eq!(worker.tasks_completed(), 1);
        assert!(worker.is_idle());
    }

    #[test]
    fn test_retire_and_doom() {
        let mut worker = cat_worker(2);
        worker.retire();
        assert_eq!(worker.status(), WorkerStatus::Retiring);
        assert!(!worker.accepts_jobs());

        worker.doom();
        worker.retire();
        assert_eq!(worker.status(), WorkerStatus::Doomed);
    }

    #[test]
    fn test_poll_exit_after_kill() {
        let mut worker = cat_worker(3);
        assert!(worker.poll_exit().is_none());

        nix::sys::signal::kill(worker.pid(), nix::sys::signal::Signal::SIGKILL).unwrap();
        let mut reason = None;
        for _ in 0..100 {
            reason = worker.poll_exit();
            if reason.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            reason,
            Some(TerminationReason::Signaled(nix::sys::signal::Signal::SIGKILL))
        );
    }
}
