//! Worker lifecycle: start, resize, replace and shut down.
//!
//! Process spawning, handshakes and stops run without the state lock; only
//! the bookkeeping around them is done under it.

use super::dispatch::spawn_reader;
use super::job::{Completion, JobId, failed};
use super::state::Lifecycle;
use super::{PoolInner, invalid_state};
use crate::config::WORKER_STOP_TIMEOUT;
use crate::error::{JobError, PoolError, Result};
use crate::worker::proc::Proc;
use crate::worker::signals::{TerminationReason, analyze_wait_status};
use crate::worker::{WorkerHandle, WorkerStatus};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Slice of time `stop` waits between maintenance passes while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a worker that closed its pipe gets to exit before it is killed.
const LOST_WORKER_GRACE: Duration = Duration::from_secs(1);

impl PoolInner {
    #[instrument(level = "debug", skip(self), fields(mode = self.spawner.mode()))]
    pub(super) fn start(self: &Arc<Self>) -> Result<()> {
        let ids = {
            let mut state = self.lock_state();
            if state.lifecycle != Lifecycle::Stopped {
                return Err(invalid_state("start", state.lifecycle));
            }
            state.lifecycle = Lifecycle::Starting;
            state.started_ok = false;
            let target = state.target;
            state.next_worker_ids(target)
        };

        tracing::info!(workers = ids.len(), "Starting worker pool");

        let spawned = self
            .ensure_collector()
            .and_then(|()| self.spawn_workers(&ids));

        let mut state = self.lock_state();
        match spawned {
            Ok(workers) if state.lifecycle == Lifecycle::Starting => {
                state.workers.extend(workers);
                state.lifecycle = Lifecycle::Running;
                state.started_ok = true;
                state.dispatch_queued();
                drop(state);
                self.changed.notify_all();
                tracing::info!(workers = ids.len(), "All workers ready");
                Ok(())
            }
            Ok(workers) => {
                // Terminated while the handshakes were running.
                let lifecycle = state.lifecycle;
                drop(state);
                self.kill_all(workers);
                Err(invalid_state("start", lifecycle))
            }
            Err(e) => {
                if state.lifecycle == Lifecycle::Starting {
                    state.lifecycle = Lifecycle::Stopped;
                }
                drop(state);
                self.shutdown_collector();
                self.changed.notify_all();
                Err(e)
            }
        }
    }

    /// Spawn one worker per id and wait for every handshake.
    ///
    /// Either all workers come up or none is kept: on any failure every
    /// spawned process is killed and [`PoolError::Startup`] lists the ids
    /// that failed.
    fn spawn_workers(&self, ids: &[usize]) -> Result<Vec<WorkerHandle>> {
        let mut procs: Vec<(usize, Proc)> = Vec::with_capacity(ids.len());
        let mut failed: Vec<(usize, String)> = Vec::new();

        for &id in ids {
            match self.spawner.spawn(id) {
                Ok(proc) => procs.push((id, proc)),
                Err(e) => failed.push((id, e.to_string())),
            }
        }

        let mut ready = Vec::with_capacity(procs.len());
        for (id, mut proc) in procs {
            match proc.wait_ready(self.config.startup_timeout) {
                Ok(pid) => {
                    tracing::debug!(worker_id = id, pid, "Worker ready");
                    ready.push((id, proc));
                }
                Err(e) => {
                    tracing::warn!(worker_id = id, pid = proc.pid().as_raw(), error = %e, "Worker failed to start");
                    failed.push((id, worker_error_reason(e)));
                    let _ = proc.kill();
                }
            }
        }

        if !failed.is_empty() {
            for (_, mut proc) in ready {
                let _ = proc.kill();
            }
            failed.sort_by_key(|(id, _)| *id);
            return Err(PoolError::Startup { failed });
        }

        let events = self.event_sender()?;
        let mut workers = Vec::with_capacity(ready.len());
        for (id, mut proc) in ready {
            let reader = proc
                .take_reader()
                .ok_or_else(|| PoolError::Worker("Reader already detached".into()))?;
            spawn_reader(id, reader, events.clone())?;
            workers.push(WorkerHandle::new(id, proc));
        }
        Ok(workers)
    }

    /// Spawn `n` workers outside the lock, with the slots reserved in
    /// `state.spawning` for the duration.
    fn spawn_reserved(&self, ids: &[usize]) -> Result<Vec<WorkerHandle>> {
        let result = self.spawn_workers(ids);
        self.lock_state().spawning -= ids.len();
        result
    }

    #[instrument(level = "debug", skip(self))]
    pub(super) fn grow(&self, n: usize) -> Result<usize> {
        let ids = {
            let mut state = self.lock_state();
            if state.lifecycle != Lifecycle::Running {
                return Err(invalid_state("grow", state.lifecycle));
            }
            state.target += n;
            state.spawning += n;
            state.next_worker_ids(n)
        };

        match self.spawn_reserved(&ids) {
            Ok(workers) => {
                let total = self.adopt(workers)?;
                tracing::info!(added = n, total, "Grew worker pool");
                Ok(total)
            }
            Err(e) => {
                let mut state = self.lock_state();
                state.target = state.target.saturating_sub(n);
                Err(e)
            }
        }
    }

    /// Add freshly spawned workers to a running pool. Returns the number of
    /// serving workers.
    fn adopt(&self, workers: Vec<WorkerHandle>) -> Result<usize> {
        let mut state = self.lock_state();
        if !state.lifecycle.is_active() {
            let lifecycle = state.lifecycle;
            drop(state);
            self.kill_all(workers);
            return Err(invalid_state("add workers to", lifecycle));
        }
        state.workers.extend(workers);
        state.dispatch_queued();
        let total = state.serving_count();
        drop(state);
        self.changed.notify_all();
        Ok(total)
    }

    #[instrument(level = "debug", skip(self))]
    pub(super) fn shrink(&self, n: usize) -> Result<usize> {
        let (drained, remaining) = {
            let mut state = self.lock_state();
            if state.lifecycle != Lifecycle::Running {
                return Err(invalid_state("shrink", state.lifecycle));
            }
            let mut candidates: Vec<(Instant, usize)> = state
                .workers
                .iter()
                .filter(|w| w.status() == WorkerStatus::Ready)
                .map(|w| (w.last_used(), w.id()))
                .collect();
            if n > candidates.len() {
                return Err(PoolError::InvalidState(format!(
                    "cannot shrink by {}: only {} workers serving",
                    n,
                    candidates.len()
                )));
            }
            candidates.sort();
            for (_, id) in candidates.into_iter().take(n) {
                if let Some(worker) = state.worker_mut(id) {
                    worker.retire();
                }
            }
            state.target = state.target.saturating_sub(n);
            let drained = state.take_drained();
            (drained, state.serving_count())
        };

        tracing::info!(
            removed = n,
            stopped_now = drained.len(),
            remaining,
            "Shrank worker pool"
        );
        self.stop_workers(drained);
        self.changed.notify_all();
        Ok(remaining)
    }

    #[instrument(level = "debug", skip(self))]
    pub(super) fn restart(&self) -> Result<()> {
        let (old, ids) = {
            let mut state = self.lock_state();
            if state.lifecycle != Lifecycle::Running {
                return Err(invalid_state("restart", state.lifecycle));
            }
            let old: Vec<usize> = state
                .workers
                .iter()
                .filter(|w| w.status() == WorkerStatus::Ready)
                .map(|w| w.id())
                .collect();
            let n = state.target;
            state.spawning += n;
            (old, state.next_worker_ids(n))
        };

        let workers = self.spawn_reserved(&ids)?;
        let drained = {
            let mut state = self.lock_state();
            if !state.lifecycle.is_active() {
                let lifecycle = state.lifecycle;
                drop(state);
                self.kill_all(workers);
                return Err(invalid_state("restart", lifecycle));
            }
            state.workers.extend(workers);
            for id in &old {
                if let Some(worker) = state.worker_mut(*id) {
                    worker.retire();
                }
            }
            state.dispatch_queued();
            state.take_drained()
        };

        tracing::info!(
            replaced = old.len(),
            started = ids.len(),
            "Restarted worker pool"
        );
        self.stop_workers(drained);
        self.changed.notify_all();
        Ok(())
    }

    pub(super) fn close(&self) -> Result<()> {
        let mut state = self.lock_state();
        match state.lifecycle {
            Lifecycle::Running => {
                state.lifecycle = Lifecycle::Draining;
                tracing::info!(in_flight = state.in_flight(), "Pool closed");
            }
            Lifecycle::Draining => {}
            other => return Err(invalid_state("close", other)),
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub(super) fn stop(&self) -> Result<()> {
        {
            let mut state = self.lock_state();
            match state.lifecycle {
                Lifecycle::Stopped | Lifecycle::Terminated => return Ok(()),
                Lifecycle::Starting => return Err(invalid_state("stop", state.lifecycle)),
                Lifecycle::Running => state.lifecycle = Lifecycle::Draining,
                Lifecycle::Draining => {}
            }
        }
        self.changed.notify_all();

        // Results are delivered by the collector; waiting on it from its own
        // thread would never finish.
        if !self.on_collector_thread() {
            self.drain();
        }

        let (leftover, workers) = {
            let mut state = self.lock_state();
            if state.lifecycle != Lifecycle::Draining {
                // Terminated concurrently.
                return Ok(());
            }
            let leftover = state.finish_all(|| failed(JobError::PoolTerminated));
            state.lifecycle = Lifecycle::Stopped;
            (leftover, std::mem::take(&mut state.workers))
        };

        if !leftover.is_empty() {
            tracing::warn!(jobs = leftover.len(), "Stop grace period expired, failing jobs");
        }
        let (busy, idle): (Vec<_>, Vec<_>) = workers.into_iter().partition(|w| !w.is_idle());
        self.kill_all(busy);
        self.stop_workers(idle);
        self.shutdown_collector();
        self.complete(leftover);
        tracing::info!("Pool stopped");
        Ok(())
    }

    /// Wait for in-flight jobs to finish, running maintenance meanwhile.
    fn drain(&self) {
        let deadline = self.config.stop_timeout.map(|t| Instant::now() + t);
        loop {
            {
                let state = self.lock_state();
                if state.jobs.is_empty() || state.lifecycle != Lifecycle::Draining {
                    return;
                }
                let mut wait = DRAIN_POLL_INTERVAL;
                if let Some(deadline) = deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return;
                    }
                    wait = wait.min(remaining);
                }
                let _unused = self
                    .changed
                    .wait_timeout(state, wait)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            self.maintain();
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub(super) fn terminate(&self) -> Result<()> {
        let (jobs, workers) = {
            let mut state = self.lock_state();
            if state.lifecycle == Lifecycle::Terminated {
                return Ok(());
            }
            state.lifecycle = Lifecycle::Terminated;
            let jobs = state.finish_all(|| failed(JobError::PoolTerminated));
            (jobs, std::mem::take(&mut state.workers))
        };

        if !workers.is_empty() || !jobs.is_empty() {
            tracing::info!(
                workers = workers.len(),
                jobs = jobs.len(),
                "Terminating worker pool"
            );
        }
        self.kill_all(workers);
        self.complete(jobs);
        self.shutdown_collector();
        Ok(())
    }

    /// One maintenance pass.
    pub(super) fn maintain(&self) {
        let mut completions = self.check_timeouts();
        completions.extend(self.reap_dead());
        self.retire_drained();
        self.replenish();
        completions.extend(self.fail_stranded());
        self.complete(completions);
    }

    /// Remove workers that exited and fail the job each was running.
    pub(super) fn reap_dead(&self) -> Vec<Completion> {
        let mut state = self.lock_state();
        let mut dead: Vec<(usize, Pid, TerminationReason)> = Vec::new();
        for worker in state.workers.iter_mut() {
            if let Some(reason) = worker.poll_exit() {
                dead.push((worker.id(), worker.pid(), reason));
            }
        }

        let mut completions = Vec::new();
        for (id, pid, reason) in dead {
            let Some(mut worker) = state.remove_worker(id) else {
                continue;
            };
            log_worker_exit(id, pid, worker.status(), &reason);
            if let Some(job_id) = worker.take_current()
                && let Some(completion) = state.finish_job(
                    JobId(job_id),
                    failed(JobError::WorkerDied {
                        pid: pid.as_raw(),
                        reason: reason.description(),
                    }),
                )
            {
                completions.push(completion);
            }
        }
        if !completions.is_empty() {
            state.dispatch_queued();
        }
        completions
    }

    /// Handle a worker whose response pipe reached EOF.
    ///
    /// The handle leaves the pool at once. Waiting for the process to exit
    /// happens on a reaper thread so the collector keeps delivering results;
    /// the job then fails with the exit reason.
    pub(super) fn retire_lost_worker(self: &Arc<Self>, worker_id: usize) {
        let Some(mut worker) = self.lock_state().remove_worker(worker_id) else {
            // Already reaped or stopped by the pool.
            return;
        };
        let job = worker.take_current().map(JobId);
        let status = worker.status();
        let pid = worker.pid();
        let mut proc = worker.into_proc();

        if let Ok(Some(exit)) = proc.try_wait() {
            self.finish_lost_worker(worker_id, pid, status, job, analyze_wait_status(exit));
            return;
        }

        let pool = Arc::clone(self);
        let reaper = thread::Builder::new()
            .name(format!("procpool-reaper-{}", worker_id))
            .spawn(move || {
                let reason = wait_for_exit(&mut proc, LOST_WORKER_GRACE);
                pool.finish_lost_worker(worker_id, pid, status, job, reason);
            });
        if let Err(e) = reaper {
            tracing::error!(worker_id, error = %e, "Failed to start reaper thread");
            self.finish_lost_worker(worker_id, pid, status, job, TerminationReason::Unknown);
        }
    }

    fn finish_lost_worker(
        &self,
        worker_id: usize,
        pid: Pid,
        status: WorkerStatus,
        job: Option<JobId>,
        reason: TerminationReason,
    ) {
        log_worker_exit(worker_id, pid, status, &reason);
        let completion = job.and_then(|job_id| {
            self.lock_state().finish_job(
                job_id,
                failed(JobError::WorkerDied {
                    pid: pid.as_raw(),
                    reason: reason.description(),
                }),
            )
        });
        self.lock_state().dispatch_queued();
        self.complete(completion.into_iter().collect());
    }

    /// Stop retiring workers that have finished their last job.
    pub(super) fn retire_drained(&self) {
        let drained = self.lock_state().take_drained();
        if !drained.is_empty() {
            self.stop_workers(drained);
        }
    }

    /// Reserve slots for the workers needed to get back to the target size.
    ///
    /// A running pool refills every slot. A draining pool only replaces
    /// workers while queued jobs still need one, at most one per job.
    fn reserve_replacements(&self) -> Vec<usize> {
        let mut state = self.lock_state();
        let wanted = match state.lifecycle {
            Lifecycle::Running => state.deficit(),
            Lifecycle::Draining => state.deficit().min(state.queue.len()),
            _ => 0,
        };
        if wanted == 0 {
            return Vec::new();
        }
        state.spawning += wanted;
        state.next_worker_ids(wanted)
    }

    fn spawn_replacements(&self, ids: &[usize]) {
        tracing::info!(workers = ids.len(), "Replacing workers");
        match self.spawn_reserved(ids) {
            Ok(workers) => {
                if let Err(e) = self.adopt(workers) {
                    tracing::debug!(error = %e, "Discarded replacement workers");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to replace workers");
            }
        }
    }

    /// Spawn workers until the pool is back at its target size.
    pub(super) fn replenish(&self) {
        let ids = self.reserve_replacements();
        if !ids.is_empty() {
            self.spawn_replacements(&ids);
        }
    }

    /// Like [`replenish`](Self::replenish), but spawning on a helper thread
    /// so the caller (the collector) is not held up by worker handshakes.
    pub(super) fn replenish_in_background(self: &Arc<Self>) {
        let ids = self.reserve_replacements();
        if ids.is_empty() {
            return;
        }
        let reserved = ids.len();
        let pool = Arc::clone(self);
        let spawner = thread::Builder::new()
            .name("procpool-spawner".to_string())
            .spawn(move || pool.spawn_replacements(&ids));
        if let Err(e) = spawner {
            tracing::error!(error = %e, "Failed to start spawner thread");
            self.lock_state().spawning -= reserved;
            self.changed.notify_all();
        }
    }

    pub(super) fn worker_pids(&self) -> Vec<Pid> {
        self.lock_state()
            .workers
            .iter()
            .filter(|w| w.status() != WorkerStatus::Doomed)
            .map(|w| w.pid())
            .collect()
    }

    /// Ask workers to exit, escalating to signals if they do not.
    fn stop_workers(&self, workers: Vec<WorkerHandle>) {
        for worker in workers {
            let id = worker.id();
            let pid = worker.pid();
            if let Err(e) = worker.into_proc().stop(WORKER_STOP_TIMEOUT) {
                tracing::warn!(worker_id = id, pid = pid.as_raw(), error = %e, "Failed to stop worker");
            } else {
                tracing::debug!(worker_id = id, pid = pid.as_raw(), "Worker stopped");
            }
        }
    }

    /// SIGKILL workers through the configured killer and reap them.
    fn kill_all(&self, workers: Vec<WorkerHandle>) {
        for worker in workers {
            let pid = worker.pid();
            if let Err(e) = self.killer.kill_worker(pid, Signal::SIGKILL) {
                tracing::warn!(worker_id = worker.id(), pid = pid.as_raw(), error = %e, "Failed to kill worker");
            }
            let mut proc = worker.into_proc();
            proc.reap();
        }
    }
}

fn wait_for_exit(proc: &mut Proc, grace: Duration) -> TerminationReason {
    let start = Instant::now();
    loop {
        match proc.try_wait() {
            Ok(Some(status)) => return analyze_wait_status(status),
            Ok(None) => {}
            Err(_) => return TerminationReason::Unknown,
        }
        if start.elapsed() >= grace {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    tracing::warn!(
        pid = proc.pid().as_raw(),
        "Worker closed its pipe but kept running, killing it"
    );
    match proc.kill() {
        Ok(()) => TerminationReason::Signaled(Signal::SIGKILL),
        Err(_) => TerminationReason::Unknown,
    }
}

fn log_worker_exit(id: usize, pid: Pid, status: WorkerStatus, reason: &TerminationReason) {
    if status == WorkerStatus::Doomed {
        tracing::debug!(worker_id = id, pid = pid.as_raw(), reason = %reason, "Reaped killed worker");
    } else {
        tracing::warn!(worker_id = id, pid = pid.as_raw(), reason = %reason, "Worker exited unexpectedly");
    }
}

/// Startup failures carry just the reason; the worker id is listed separately.
fn worker_error_reason(error: PoolError) -> String {
    match error {
        PoolError::Worker(reason) => reason,
        other => other.to_string(),
    }
}
