//! Job records tracked by the pool while a job is in flight.

use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

/// Identifier of a submitted job, unique within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of a job: a registered task name and its JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub task: String,
    pub args: Value,
}

impl Job {
    pub fn new(task: impl Into<String>, args: Value) -> Self {
        Self {
            task: task.into(),
            args,
        }
    }
}

/// Per-job overrides of the pool's default timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub soft_timeout: Option<Duration>,
    pub hard_timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }

    pub fn hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout);
        self
    }
}

/// Callback invoked exactly once with the job's outcome.
pub type Callback = Box<dyn FnOnce(JobResult) + Send + 'static>;

/// Where a job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    SoftTimedOut,
    HardTimedOut,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Bookkeeping for one in-flight job.
pub(crate) struct JobRecord {
    pub id: JobId,
    /// Payload, kept until the job is handed to a worker.
    pub job: Option<Job>,
    callback: Option<Callback>,
    /// When the job was accepted; deadlines count from here.
    pub submitted_at: Instant,
    /// When the job was handed to a worker (`None` while queued).
    pub started_at: Option<Instant>,
    pub soft_timeout: Option<Duration>,
    pub hard_timeout: Option<Duration>,
    /// Worker id the job runs on (lookup only).
    pub worker: Option<usize>,
    pub state: JobState,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        job: Job,
        callback: Callback,
        soft_timeout: Option<Duration>,
        hard_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            job: Some(job),
            callback: Some(callback),
            submitted_at: Instant::now(),
            started_at: None,
            soft_timeout,
            hard_timeout,
            worker: None,
            state: JobState::Pending,
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted_at)
    }

    /// Whether the hard deadline has passed at `now`, queued or running.
    pub fn hard_expired(&self, now: Instant) -> bool {
        self.hard_timeout
            .is_some_and(|limit| self.elapsed(now) >= limit)
    }

    /// Whether the soft deadline has passed at `now` and was not yet acted on.
    pub fn soft_expired(&self, now: Instant) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        self.soft_timeout
            .is_some_and(|limit| self.elapsed(now) >= limit)
    }

    /// Move the record to its terminal state and hand back what must be
    /// invoked once the pool lock is released.
    ///
    /// Returns `None` if the record was already finalized.
    pub fn finalize(&mut self, outcome: JobResult) -> Option<Completion> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = if outcome.is_ok() {
            JobState::Completed
        } else {
            JobState::Failed
        };
        let callback = self.callback.take()?;
        Some(Completion {
            id: self.id,
            callback,
            outcome,
        })
    }
}

/// A finalized job whose callback still has to run.
pub(crate) struct Completion {
    pub id: JobId,
    callback: Callback,
    outcome: JobResult,
}

impl Completion {
    /// Invoke the callback, containing any panic it raises.
    pub fn fire(self) {
        let Completion {
            id,
            callback,
            outcome,
        } = self;
        if catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
            tracing::error!(job_id = %id, "Job callback panicked");
        }
    }
}

/// Fire completions in order.
pub(crate) fn fire_all(completions: Vec<Completion>) {
    for completion in completions {
        completion.fire();
    }
}

/// Shorthand for the failure outcome of a job.
pub(crate) fn failed(error: JobError) -> JobResult {
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(soft: Option<Duration>, hard: Option<Duration>) -> (JobRecord, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let rec = JobRecord::new(
            JobId(1),
            Job::new("echo", json!(null)),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            soft,
            hard,
        );
        (rec, calls)
    }

    #[test]
    fn test_finalize_only_once() {
        let (mut rec, calls) = record(None, None);

        let completion = rec.finalize(Ok(json!(1))).expect("first finalize wins");
        assert_eq!(rec.state, JobState::Completed);
        assert!(rec.finalize(failed(JobError::PoolTerminated)).is_none());
        assert_eq!(rec.state, JobState::Completed);

        completion.fire();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_sets_failed_state() {
        let (mut rec, _) = record(None, None);
        let completion = rec.finalize(failed(JobError::Task("x".into()))).unwrap();
        assert_eq!(rec.state, JobState::Failed);
        assert!(completion.outcome.is_err());
    }

    #[test]
    fn test_deadlines_count_from_submission() {
        let (mut rec, _) = record(Some(Duration::from_secs(5)), Some(Duration::from_secs(10)));
        let now = Instant::now();
        rec.submitted_at = now;
        // Still queued: the clock is already running.
        assert!(rec.started_at.is_none());
        assert!(rec.hard_expired(now + Duration::from_secs(60)));

        // Dispatch does not restart the clock.
        rec.started_at = Some(now + Duration::from_secs(3));
        assert!(!rec.soft_expired(now + Duration::from_secs(4)));
        assert!(rec.soft_expired(now + Duration::from_secs(5)));
        assert!(!rec.hard_expired(now + Duration::from_secs(9)));
        assert!(rec.hard_expired(now + Duration::from_secs(10)));

        rec.state = JobState::SoftTimedOut;
        assert!(!rec.soft_expired(now + Duration::from_secs(6)));
        assert!(rec.hard_expired(now + Duration::from_secs(11)));
    }

    #[test]
    fn test_no_timeouts_never_expire() {
        let (mut rec, _) = record(None, None);
        let now = rec.submitted_at;
        rec.started_at = Some(now);
        assert!(!rec.soft_expired(now + Duration::from_secs(3600)));
        assert!(!rec.hard_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut rec = JobRecord::new(
            JobId(2),
            Job::new("echo", json!(null)),
            Box::new(|_| panic!("callback bug")),
            None,
            None,
        );
        rec.finalize(Ok(json!(null))).unwrap().fire();
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::SoftTimedOut.is_terminal());
        assert!(!JobState::HardTimedOut.is_terminal());
    }
}
