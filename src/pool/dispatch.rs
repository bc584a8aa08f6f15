//! Job submission and result collection.
//!
//! Each worker has a reader thread that blocks on the worker's response pipe
//! and forwards what it reads as [`WorkerEvent`]s. A single collector thread
//! consumes the events, finalizes jobs and keeps the pool topped up.

use super::job::{Callback, Completion, Job, JobId, JobRecord, SubmitOptions, failed, fire_all};
use super::state::Lifecycle;
use super::PoolInner;
use crate::config::{Admission, validate_timeouts};
use crate::error::{JobError, PoolError, Result};
use crate::worker::WorkResponse;
use crate::worker::ipc::LineReader;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

/// Message from a reader thread to the collector.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Response {
        worker: usize,
        response: WorkResponse,
    },
    /// The worker closed its response pipe.
    Eof { worker: usize },
    /// Stop the collector.
    Shutdown,
}

/// The running collector thread and the sending side of its channel.
pub(crate) struct Collector {
    sender: Sender<WorkerEvent>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Collector {
    fn spawn(pool: Weak<PoolInner>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("procpool-collector".to_string())
            .spawn(move || collector_loop(pool, receiver))?;
        Ok(Self {
            sender,
            thread_id: thread.thread().id(),
            thread: Some(thread),
        })
    }

    pub fn sender(&self) -> Sender<WorkerEvent> {
        self.sender.clone()
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the collector, joining it unless called from the collector itself.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(WorkerEvent::Shutdown);
        if self.is_current_thread() {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn collector_loop(pool: Weak<PoolInner>, events: Receiver<WorkerEvent>) {
    tracing::debug!("Collector thread started");

    while let Ok(event) = events.recv() {
        if matches!(event, WorkerEvent::Shutdown) {
            break;
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.handle_event(event);
    }

    tracing::debug!("Collector thread stopped");
}

/// Forward everything a worker writes to the collector until EOF.
pub(crate) fn spawn_reader(
    worker: usize,
    mut reader: LineReader,
    events: Sender<WorkerEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("procpool-reader-{}", worker))
        .spawn(move || {
            loop {
                let line = match reader.read_line() {
                    Ok(Some(line)) => line.to_string(),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(worker_id = worker, error = %e, "Worker pipe read failed");
                        break;
                    }
                };
                match WorkResponse::from_line(&line) {
                    Ok(response) => {
                        if events
                            .send(WorkerEvent::Response { worker, response })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            worker_id = worker,
                            error = %e,
                            line = %line,
                            "Ignoring malformed worker response"
                        );
                    }
                }
            }
            let _ = events.send(WorkerEvent::Eof { worker });
        })?;
    Ok(())
}

impl PoolInner {
    pub(super) fn ensure_collector(self: &Arc<Self>) -> Result<()> {
        let mut collector = self
            .collector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if collector.is_none() {
            *collector = Some(Collector::spawn(Arc::downgrade(self))?);
        }
        Ok(())
    }

    pub(super) fn event_sender(&self) -> Result<Sender<WorkerEvent>> {
        self.collector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(Collector::sender)
            .ok_or(PoolError::PoolNotRunning)
    }

    pub(super) fn on_collector_thread(&self) -> bool {
        self.collector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(Collector::is_current_thread)
    }

    pub(super) fn shutdown_collector(&self) {
        let collector = self
            .collector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(collector) = collector {
            collector.shutdown();
        }
    }

    pub(super) fn submit(
        &self,
        job: Job,
        options: SubmitOptions,
        callback: Callback,
    ) -> Result<JobId> {
        let soft = options.soft_timeout.or(self.config.soft_timeout);
        let hard = options.hard_timeout.or(self.config.hard_timeout);
        validate_timeouts(soft, hard)?;

        let mut state = self.lock_state();
        if state.lifecycle != Lifecycle::Running {
            return Err(PoolError::PoolNotRunning);
        }

        match self.config.admission {
            Admission::Unbounded => {}
            Admission::FailFast => {
                if state.in_flight() >= state.serving_count() {
                    return Err(PoolError::Backpressure);
                }
            }
            Admission::Block { timeout } => {
                let deadline = timeout.map(|t| Instant::now() + t);
                while state.lifecycle == Lifecycle::Running
                    && state.in_flight() >= state.serving_count()
                {
                    state = match deadline {
                        None => self
                            .changed
                            .wait(state)
                            .unwrap_or_else(std::sync::PoisonError::into_inner),
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Err(PoolError::Backpressure);
                            }
                            self.changed
                                .wait_timeout(state, remaining)
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .0
                        }
                    };
                }
                if state.lifecycle != Lifecycle::Running {
                    return Err(PoolError::PoolNotRunning);
                }
            }
        }

        let id = state.next_job_id();
        tracing::debug!(job_id = %id, task = %job.task, "Submitted job");
        state
            .jobs
            .insert(id, JobRecord::new(id, job, callback, soft, hard));
        state.queue.push_back(id);
        state.dispatch_queued();
        Ok(id)
    }

    pub(super) fn handle_event(self: &Arc<Self>, event: WorkerEvent) {
        match event {
            WorkerEvent::Response { worker, response } => self.handle_response(worker, response),
            WorkerEvent::Eof { worker } => {
                self.retire_lost_worker(worker);
                self.replenish_in_background();
                let stranded = self.fail_stranded();
                self.complete(stranded);
            }
            WorkerEvent::Shutdown => {}
        }
    }

    fn handle_response(self: &Arc<Self>, worker_id: usize, response: WorkResponse) {
        let (job_id, outcome) = match response {
            WorkResponse::Result { job_id, value } => (job_id, Ok(value)),
            WorkResponse::Error {
                job_id: Some(job_id),
                message,
            } => (job_id, failed(JobError::Task(message))),
            WorkResponse::Error {
                job_id: None,
                message,
            } => {
                tracing::warn!(worker_id, message = %message, "Worker reported an error");
                return;
            }
            other => {
                tracing::debug!(worker_id, response = ?other, "Unexpected worker message");
                return;
            }
        };

        let completion = self.deliver(worker_id, JobId(job_id), outcome);
        self.retire_drained();
        self.replenish_in_background();
        if let Some(completion) = completion {
            completion.fire();
        }
    }

    /// Record a worker's answer for `job_id` and hand the worker its next job.
    fn deliver(
        &self,
        worker_id: usize,
        job_id: JobId,
        outcome: crate::error::JobResult,
    ) -> Option<Completion> {
        let mut state = self.lock_state();
        let max_tasks = self.config.max_tasks_per_worker;

        if let Some(worker) = state.worker_mut(worker_id)
            && worker.complete(job_id.0)
            && let Some(max) = max_tasks
            && worker.tasks_completed() >= max
        {
            tracing::debug!(
                worker_id,
                pid = worker.pid().as_raw(),
                tasks = worker.tasks_completed(),
                "Worker reached max tasks, recycling"
            );
            worker.retire();
        }

        let completion = state.finish_job(job_id, outcome);
        if completion.is_none() {
            tracing::debug!(job_id = %job_id, worker_id, "Ignoring result for finalized job");
        }
        state.dispatch_queued();
        drop(state);
        self.changed.notify_all();
        completion
    }

    /// Fire completions after waking anyone waiting on pool changes.
    pub(super) fn complete(&self, completions: Vec<Completion>) {
        self.changed.notify_all();
        fire_all(completions);
    }

    /// Fail queued jobs that can no longer run: the pool is draining, has no
    /// worker left to take them and no replacement on the way.
    pub(super) fn fail_stranded(&self) -> Vec<Completion> {
        let mut state = self.lock_state();
        if state.lifecycle != Lifecycle::Draining
            || state.live_count() > 0
            || state.spawning > 0
        {
            return Vec::new();
        }
        let stranded: Vec<JobId> = state.queue.iter().copied().collect();
        if !stranded.is_empty() {
            tracing::warn!(jobs = stranded.len(), "No workers left to drain queued jobs");
        }
        stranded
            .into_iter()
            .filter_map(|id| state.finish_job(id, failed(JobError::PoolTerminated)))
            .collect()
    }
}
