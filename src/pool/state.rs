//! Shared mutable state of a pool, guarded by a single mutex.

use super::job::{Completion, JobId, JobRecord};
use crate::error::JobResult;
use crate::worker::{WorkRequest, WorkerHandle, WorkerStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Pool lifecycle.
///
/// ```text
/// Stopped ──start──▶ Starting ──▶ Running ──close──▶ Draining ──stop──▶ Stopped
///                                    │                   │
///                                    └──────terminate────┴──────▶ Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Draining,
    Terminated,
}

impl Lifecycle {
    /// Whether in-flight jobs are still being serviced.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Draining)
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

pub(crate) struct PoolState {
    pub lifecycle: Lifecycle,
    pub workers: Vec<WorkerHandle>,
    pub jobs: HashMap<JobId, JobRecord>,
    /// Jobs accepted but not yet handed to a worker, oldest first.
    pub queue: VecDeque<JobId>,
    /// Target worker count; `workers` converges to it on maintenance.
    pub target: usize,
    /// Workers being spawned outside the lock, counted against `target`.
    pub spawning: usize,
    pub started_ok: bool,
    next_job_id: u64,
    next_worker_id: usize,
}

impl PoolState {
    pub fn new(target: usize) -> Self {
        Self {
            lifecycle: Lifecycle::Stopped,
            workers: Vec::new(),
            jobs: HashMap::new(),
            queue: VecDeque::new(),
            target,
            spawning: 0,
            started_ok: false,
            next_job_id: 1,
            next_worker_id: 0,
        }
    }

    pub fn next_job_id(&mut self) -> JobId {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        id
    }

    /// Reserve `n` fresh worker ids.
    pub fn next_worker_ids(&mut self, n: usize) -> Vec<usize> {
        let start = self.next_worker_id;
        self.next_worker_id += n;
        (start..start + n).collect()
    }

    pub fn worker_mut(&mut self, id: usize) -> Option<&mut WorkerHandle> {
        self.workers.iter_mut().find(|w| w.id() == id)
    }

    pub fn remove_worker(&mut self, id: usize) -> Option<WorkerHandle> {
        let idx = self.workers.iter().position(|w| w.id() == id)?;
        Some(self.workers.remove(idx))
    }

    /// Workers that count towards capacity (not retiring or doomed).
    pub fn serving_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status() == WorkerStatus::Ready)
            .count()
    }

    /// Workers still needed to reach `target`.
    pub fn deficit(&self) -> usize {
        self.target
            .saturating_sub(self.serving_count() + self.spawning)
    }

    /// Live workers, including retiring ones still finishing a job.
    pub fn live_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status() != WorkerStatus::Doomed)
            .count()
    }

    /// Retiring workers with no job left, removed from the pool.
    pub fn take_drained(&mut self) -> Vec<WorkerHandle> {
        let (drained, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.status() == WorkerStatus::Retiring && w.is_idle());
        self.workers = kept;
        drained
    }

    /// Jobs accepted and not yet finalized, queued or running.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Least-recently-used worker that can take a job right now.
    pub fn idle_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .filter(|w| w.accepts_jobs())
            .min_by_key(|w| w.last_used())
            .map(|w| w.id())
    }

    /// Remove a job from the in-flight set and finalize it.
    ///
    /// This is the single point where a job reaches a terminal state; the
    /// caller that removes the record wins, later attempts find nothing.
    pub fn finish_job(&mut self, id: JobId, outcome: JobResult) -> Option<Completion> {
        let mut record = self.jobs.remove(&id)?;
        self.queue.retain(|queued| *queued != id);
        record.finalize(outcome)
    }

    /// Finalize every in-flight job with the same failure.
    pub fn finish_all(&mut self, outcome: impl Fn() -> JobResult) -> Vec<Completion> {
        self.queue.clear();
        let mut records: Vec<JobRecord> = self.jobs.drain().map(|(_, rec)| rec).collect();
        records.sort_by_key(|rec| rec.id);
        records
            .into_iter()
            .filter_map(|mut rec| rec.finalize(outcome()))
            .collect()
    }

    /// Hand queued jobs to idle workers, oldest job to least-recently-used
    /// worker. Workers whose pipe is broken are doomed and the job stays
    /// queued.
    pub fn dispatch_queued(&mut self) -> usize {
        let mut dispatched = 0;
        while let Some(&job_id) = self.queue.front() {
            let Some(worker_id) = self.idle_worker() else {
                break;
            };
            let Some(record) = self.jobs.get_mut(&job_id) else {
                self.queue.pop_front();
                continue;
            };
            let Some(job) = record.job.as_ref() else {
                self.queue.pop_front();
                continue;
            };
            let request = WorkRequest::run(job_id.0, job.task.clone(), job.args.clone());

            let Some(worker) = self.workers.iter_mut().find(|w| w.id() == worker_id) else {
                break;
            };
            match worker.assign(job_id.0, &request) {
                Ok(()) => {
                    record.job = None;
                    record.worker = Some(worker_id);
                    record.started_at = Some(Instant::now());
                    self.queue.pop_front();
                    dispatched += 1;
                    tracing::trace!(
                        job_id = %job_id,
                        worker_id,
                        pid = worker.pid().as_raw(),
                        "Dispatched job"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id,
                        pid = worker.pid().as_raw(),
                        error = %e,
                        "Failed to send job to worker, marking it for replacement"
                    );
                    worker.doom();
                }
            }
        }
        dispatched
    }
}
