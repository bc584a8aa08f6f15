//! Soft and hard time limits.
//!
//! The hard limit is checked first and always wins: a job past both limits in
//! the same pass is killed, and a soft action taken earlier never prevents a
//! later hard kill.
//!
//! Both limits count from submission, so a job can expire while still
//! queued. Such a job fails without ever reaching a worker.

use super::PoolInner;
use super::job::{Completion, JobId, JobState, failed};
use super::state::PoolState;
use crate::config::SoftTimeoutAction;
use crate::error::JobError;
use std::time::Instant;

impl PoolInner {
    /// Scan in-flight jobs and act on expired limits.
    ///
    /// Returns completions of hard-timed-out jobs, to be fired once the lock
    /// is released.
    pub(super) fn check_timeouts(&self) -> Vec<Completion> {
        let now = Instant::now();
        let mut state = self.lock_state();

        let hard: Vec<JobId> = state
            .jobs
            .values()
            .filter(|rec| rec.hard_expired(now))
            .map(|rec| rec.id)
            .collect();
        let completions: Vec<Completion> = hard
            .into_iter()
            .filter_map(|id| self.hard_timeout(&mut state, id, now))
            .collect();

        let soft: Vec<JobId> = state
            .jobs
            .values()
            .filter(|rec| rec.soft_expired(now))
            .map(|rec| rec.id)
            .collect();
        for id in soft {
            self.soft_timeout(&mut state, id);
        }

        if !completions.is_empty() {
            state.dispatch_queued();
        }
        completions
    }

    pub(super) fn force_soft_timeout(&self, id: JobId) -> bool {
        let mut state = self.lock_state();
        match state.jobs.get(&id) {
            Some(rec) if rec.state == JobState::Pending => {}
            _ => return false,
        }
        self.soft_timeout(&mut state, id);
        true
    }

    pub(super) fn force_hard_timeout(&self, id: JobId) -> bool {
        let completion = {
            let mut state = self.lock_state();
            let completion = self.hard_timeout(&mut state, id, Instant::now());
            state.dispatch_queued();
            completion
        };
        match completion {
            Some(completion) => {
                self.complete(vec![completion]);
                true
            }
            None => false,
        }
    }

    /// Flag the job and apply the configured soft action to its worker.
    fn soft_timeout(&self, state: &mut PoolState, id: JobId) {
        let Some(record) = state.jobs.get_mut(&id) else {
            return;
        };
        record.state = JobState::SoftTimedOut;
        let worker_id = record.worker;
        tracing::warn!(job_id = %id, limit = ?record.soft_timeout, "Soft time limit exceeded");

        let SoftTimeoutAction::Signal(signal) = self.config.soft_timeout_action else {
            return;
        };
        // Signal only while the worker is still on this job, so the signal
        // cannot land on whatever it picks up next.
        if let Some(worker_id) = worker_id
            && let Some(worker) = state.worker_mut(worker_id)
            && worker.current_job() == Some(id.0)
            && let Err(e) = self.killer.kill_worker(worker.pid(), signal)
        {
            tracing::warn!(
                job_id = %id,
                pid = worker.pid().as_raw(),
                error = %e,
                "Failed to signal worker on soft timeout"
            );
        }
    }

    /// Kill the job's worker and finalize the job as failed.
    fn hard_timeout(&self, state: &mut PoolState, id: JobId, now: Instant) -> Option<Completion> {
        let record = state.jobs.get_mut(&id)?;
        record.state = JobState::HardTimedOut;
        let limit = record
            .hard_timeout
            .unwrap_or_else(|| record.elapsed(now));
        let worker_id = record.worker;
        if record.started_at.is_none() {
            tracing::warn!(job_id = %id, limit = ?limit, "Hard time limit exceeded while queued");
        }

        if let Some(worker_id) = worker_id
            && let Some(worker) = state.worker_mut(worker_id)
            && worker.current_job() == Some(id.0)
        {
            let pid = worker.pid();
            worker.take_current();
            worker.doom();
            tracing::warn!(
                job_id = %id,
                worker_id,
                pid = pid.as_raw(),
                limit = ?limit,
                "Hard time limit exceeded, killing worker"
            );
            if let Err(e) = self
                .killer
                .kill_worker(pid, self.config.hard_timeout_signal)
            {
                tracing::error!(pid = pid.as_raw(), error = %e, "Failed to kill worker");
            }
        }

        state.finish_job(id, failed(JobError::HardTimeout { limit }))
    }
}
