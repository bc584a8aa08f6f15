//! End-to-end tests for the task pool.
//!
//! Most tests fork workers from the test binary; the exec-mode tests run the
//! `procpool worker` binary or a scripted stand-in.

use procpool::tasks::builtin_registry;
use procpool::{
    Admission, ExecCommand, Job, JobError, JobId, JobResult, JobState, Lifecycle, PoolConfig,
    PoolError, SubmitOptions, TaskPool, TaskRegistry, WorkerRuntime, WorkerSetup,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Set by the initializer inside each worker process.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

const WAIT: Duration = Duration::from_secs(10);

fn registry() -> TaskRegistry {
    builtin_registry()
        .with("pid", |_ctx, _args| Ok(json!(std::process::id())))
        .with("initialized", |_ctx, _args| {
            Ok(json!(INITIALIZED.load(Ordering::SeqCst)))
        })
}

fn runtime() -> WorkerRuntime {
    WorkerRuntime::new(registry()).with_initializer(|_ctx| {
        INITIALIZED.store(true, Ordering::SeqCst);
        Ok(())
    })
}

fn start_pool(config: PoolConfig) -> TaskPool {
    let pool = TaskPool::new(config, WorkerSetup::Fork(runtime())).unwrap();
    pool.start().unwrap();
    pool
}

fn submit(pool: &TaskPool, task: &str, args: Value) -> Receiver<JobResult> {
    submit_with(pool, task, args, SubmitOptions::default()).1
}

fn submit_with(
    pool: &TaskPool,
    task: &str,
    args: Value,
    options: SubmitOptions,
) -> (JobId, Receiver<JobResult>) {
    let (tx, rx) = mpsc::channel();
    let id = pool
        .submit_with(Job::new(task, args), options, move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    (id, rx)
}

/// Wait for a job outcome, running maintenance passes meanwhile.
fn wait(pool: &TaskPool, rx: &Receiver<JobResult>) -> JobResult {
    let start = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_millis(10)) {
            Ok(outcome) => return outcome,
            Err(RecvTimeoutError::Timeout) => {
                assert!(start.elapsed() < WAIT, "job did not finish in time");
                pool.maintain();
            }
            Err(RecvTimeoutError::Disconnected) => panic!("callback dropped without firing"),
        }
    }
}

fn wait_until(pool: &TaskPool, mut cond: impl FnMut(&TaskPool) -> bool) {
    let start = Instant::now();
    while !cond(pool) {
        assert!(start.elapsed() < WAIT, "condition not reached in time");
        pool.maintain();
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn sleep_args(ms: u64) -> Value {
    json!({ "ms": ms })
}

#[test]
fn test_echo_jobs_complete() {
    let pool = start_pool(PoolConfig::new(2));
    assert!(pool.did_start_ok());
    assert_eq!(pool.lifecycle(), Lifecycle::Running);
    assert_eq!(pool.active_process_count(), 2);

    let receivers: Vec<_> = (0..10).map(|i| submit(&pool, "echo", json!(i))).collect();
    for (i, rx) in receivers.iter().enumerate() {
        assert_eq!(wait(&pool, rx), Ok(json!(i)));
    }
    assert_eq!(pool.pending_job_count(), 0);
    pool.stop().unwrap();
    assert_eq!(pool.lifecycle(), Lifecycle::Stopped);
}

#[test]
fn test_initializer_ran_in_worker() {
    let pool = start_pool(PoolConfig::new(1));
    let rx = submit(&pool, "initialized", Value::Null);
    assert_eq!(wait(&pool, &rx), Ok(json!(true)));
}

#[test]
fn test_task_errors_are_reported() {
    let pool = start_pool(PoolConfig::new(1));

    let rx = submit(&pool, "fail", json!({"message": "bad input"}));
    assert_eq!(wait(&pool, &rx), Err(JobError::Task("bad input".into())));

    let rx = submit(&pool, "nope", Value::Null);
    match wait(&pool, &rx) {
        Err(JobError::Task(message)) => assert!(message.contains("Unknown task")),
        other => panic!("unexpected outcome: {:?}", other),
    }

    // The worker survives task errors.
    let rx = submit(&pool, "echo", json!("still here"));
    assert_eq!(wait(&pool, &rx), Ok(json!("still here")));
}

#[test]
fn test_hard_timeout_kills_and_replaces_worker() {
    let pool = start_pool(PoolConfig::new(1));
    let old_pid = pool.worker_pids()[0];

    let (_, rx) = submit_with(
        &pool,
        "sleep",
        sleep_args(10_000),
        SubmitOptions::default().hard_timeout(Duration::from_millis(200)),
    );
    let started = Instant::now();
    assert_eq!(
        wait(&pool, &rx),
        Err(JobError::HardTimeout {
            limit: Duration::from_millis(200)
        })
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    wait_until(&pool, |p| {
        let pids = p.worker_pids();
        pids.len() == 1 && pids[0] != old_pid
    });
    let rx = submit(&pool, "echo", json!(1));
    assert_eq!(wait(&pool, &rx), Ok(json!(1)));
}

#[test]
fn test_soft_timeout_cancels_cooperative_task() {
    let pool = start_pool(PoolConfig::new(1));
    let (id, rx) = submit_with(
        &pool,
        "sleep",
        json!({"ms": 10_000, "honor_cancel": true}),
        SubmitOptions::default()
            .soft_timeout(Duration::from_millis(100))
            .hard_timeout(Duration::from_secs(8)),
    );

    let outcome = wait(&pool, &rx).unwrap();
    assert_eq!(outcome["cancelled"], json!(true));
    assert!(outcome["slept_ms"].as_u64().unwrap() < 8_000);
    assert_eq!(pool.job_state(id), None);
}

#[test]
fn test_hard_timeout_follows_ignored_soft_timeout() {
    let pool = start_pool(PoolConfig::new(1));
    let (id, rx) = submit_with(
        &pool,
        "sleep",
        sleep_args(10_000),
        SubmitOptions::default()
            .soft_timeout(Duration::from_millis(100))
            .hard_timeout(Duration::from_millis(600)),
    );

    wait_until(&pool, |p| p.job_state(id) != Some(JobState::Pending));
    assert!(matches!(
        pool.job_state(id),
        Some(JobState::SoftTimedOut) | None
    ));
    assert!(matches!(
        wait(&pool, &rx),
        Err(JobError::HardTimeout { .. })
    ));
}

#[test]
fn test_jobs_without_timeouts_are_never_flagged() {
    let pool = start_pool(PoolConfig::new(1));
    let (id, rx) = submit_with(&pool, "sleep", sleep_args(300), SubmitOptions::default());
    for _ in 0..10 {
        pool.maintain();
        assert!(matches!(pool.job_state(id), Some(JobState::Pending) | None));
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(wait(&pool, &rx).is_ok());
}

#[test]
fn test_hard_timeout_expires_queued_job() {
    let pool = start_pool(PoolConfig::new(1));
    let busy = submit(&pool, "sleep", sleep_args(1_500));
    let (id, queued) = submit_with(
        &pool,
        "echo",
        json!("late"),
        SubmitOptions::default().hard_timeout(Duration::from_millis(100)),
    );

    let started = Instant::now();
    assert_eq!(
        wait(&pool, &queued),
        Err(JobError::HardTimeout {
            limit: Duration::from_millis(100)
        })
    );
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert_eq!(pool.job_state(id), None);

    // The worker was never touched: the running job finishes normally.
    assert!(wait(&pool, &busy).is_ok());
    assert_eq!(pool.active_process_count(), 1);
}

#[test]
fn test_terminate_fails_in_flight_jobs_synchronously() {
    // Two workers for three jobs: one job is still queued.
    let pool = start_pool(PoolConfig::new(2));
    let pids = pool.worker_pids();
    let fired = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    for _ in 0..3 {
        let fired = fired.clone();
        let tx = tx.clone();
        pool.submit(Job::new("sleep", sleep_args(10_000)), move |outcome| {
            fired.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome);
        })
        .unwrap();
    }

    pool.terminate().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    for _ in 0..3 {
        assert_eq!(rx.recv().unwrap(), Err(JobError::PoolTerminated));
    }
    assert_eq!(pool.lifecycle(), Lifecycle::Terminated);
    assert_eq!(pool.active_process_count(), 0);
    for pid in pids {
        assert!(nix::sys::signal::kill(pid, None).is_err(), "{} still alive", pid);
    }

    // Idempotent, and the pool stays down.
    pool.terminate().unwrap();
    pool.stop().unwrap();
    assert!(matches!(
        pool.submit(Job::new("echo", Value::Null), |_| {}),
        Err(PoolError::PoolNotRunning)
    ));
    assert!(pool.start().is_err());
}

#[test]
fn test_close_rejects_new_jobs_and_drains() {
    let pool = start_pool(PoolConfig::new(1));
    let receivers: Vec<_> = (0..3).map(|_| submit(&pool, "sleep", sleep_args(50))).collect();

    pool.close().unwrap();
    assert_eq!(pool.lifecycle(), Lifecycle::Draining);
    assert!(matches!(
        pool.submit(Job::new("echo", Value::Null), |_| {}),
        Err(PoolError::PoolNotRunning)
    ));

    pool.stop().unwrap();
    for rx in &receivers {
        assert!(rx.recv().unwrap().is_ok());
    }
    pool.stop().unwrap();
    assert_eq!(pool.lifecycle(), Lifecycle::Stopped);
}

#[test]
fn test_stop_runs_queued_job_after_recycling() {
    let pool = start_pool(PoolConfig::new(1).with_max_tasks_per_worker(1));
    let first = submit(&pool, "sleep", sleep_args(200));
    let second = submit(&pool, "echo", json!("queued"));

    // The only worker retires after the first job; the queued one still
    // needs a replacement while the pool drains.
    pool.stop().unwrap();
    assert!(first.recv_timeout(WAIT).unwrap().is_ok());
    assert_eq!(second.recv_timeout(WAIT).unwrap(), Ok(json!("queued")));
    assert_eq!(pool.lifecycle(), Lifecycle::Stopped);
    assert_eq!(pool.active_process_count(), 0);
}

#[test]
fn test_stop_grace_period_fails_leftovers() {
    let pool = start_pool(PoolConfig::new(1).with_stop_timeout(Duration::from_millis(100)));
    let rx = submit(&pool, "sleep", sleep_args(10_000));

    let started = Instant::now();
    pool.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(rx.recv().unwrap(), Err(JobError::PoolTerminated));
}

#[test]
fn test_pool_restarts_after_stop() {
    let pool = start_pool(PoolConfig::new(1));
    pool.stop().unwrap();
    pool.start().unwrap();
    let rx = submit(&pool, "echo", json!("again"));
    assert_eq!(wait(&pool, &rx), Ok(json!("again")));
}

#[test]
fn test_grow_and_shrink() {
    let pool = start_pool(PoolConfig::new(1));
    assert_eq!(pool.grow(2).unwrap(), 3);
    assert_eq!(pool.worker_pids().len(), 3);
    assert_eq!(pool.info().max_concurrency, 3);

    assert_eq!(pool.shrink(1).unwrap(), 2);
    assert_eq!(pool.active_process_count(), 2);
    assert!(matches!(pool.shrink(5), Err(PoolError::InvalidState(_))));

    // Replenishment keeps the new size.
    pool.maintain();
    assert_eq!(pool.active_process_count(), 2);
}

#[test]
fn test_shrink_waits_for_busy_worker() {
    let pool = start_pool(PoolConfig::new(2));
    let first = submit(&pool, "sleep", sleep_args(300));
    let second = submit(&pool, "sleep", sleep_args(300));

    assert_eq!(pool.shrink(1).unwrap(), 1);
    // The retiring worker is still finishing its job.
    assert_eq!(pool.active_process_count(), 2);

    assert!(wait(&pool, &first).is_ok());
    assert!(wait(&pool, &second).is_ok());
    wait_until(&pool, |p| p.active_process_count() == 1);
}

#[test]
fn test_resize_requires_running_pool() {
    let pool = TaskPool::new(PoolConfig::new(1), WorkerSetup::Fork(runtime())).unwrap();
    assert!(matches!(pool.grow(1), Err(PoolError::InvalidState(_))));
    assert!(matches!(pool.shrink(1), Err(PoolError::InvalidState(_))));
    assert!(matches!(
        pool.submit(Job::new("echo", Value::Null), |_| {}),
        Err(PoolError::PoolNotRunning)
    ));
}

#[test]
fn test_restart_replaces_every_worker() {
    let pool = start_pool(PoolConfig::new(2));
    let old = pool.worker_pids();

    pool.restart().unwrap();
    wait_until(&pool, |p| p.active_process_count() == 2);
    let new = pool.worker_pids();
    assert_eq!(new.len(), 2);
    assert!(new.iter().all(|pid| !old.contains(pid)));

    let rx = submit(&pool, "echo", json!(7));
    assert_eq!(wait(&pool, &rx), Ok(json!(7)));
}

#[test]
fn test_restart_keeps_capacity() {
    let pool = start_pool(PoolConfig::new(2));
    let done = AtomicBool::new(false);
    let lowest = AtomicUsize::new(usize::MAX);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                lowest.fetch_min(pool.active_process_count(), Ordering::SeqCst);
            }
        });
        for _ in 0..3 {
            pool.restart().unwrap();
        }
        done.store(true, Ordering::SeqCst);
    });

    assert!(lowest.load(Ordering::SeqCst) >= 2);
    assert_eq!(pool.active_process_count(), 2);
}

#[test]
fn test_dead_worker_fails_job_and_is_replaced() {
    let pool = start_pool(PoolConfig::new(1));
    let old_pid = pool.worker_pids()[0];

    let rx = submit(&pool, "exit", json!({"code": 3}));
    match wait(&pool, &rx) {
        Err(JobError::WorkerDied { pid, reason }) => {
            assert_eq!(pid, old_pid.as_raw());
            assert_eq!(reason, "exited with code 3");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    wait_until(&pool, |p| {
        p.worker_pids().first().is_some_and(|pid| *pid != old_pid)
    });
    let rx = submit(&pool, "echo", json!("replaced"));
    assert_eq!(wait(&pool, &rx), Ok(json!("replaced")));
}

/// A worker that reports ready, takes one job, then closes its output and
/// lingers without answering.
fn lingering_worker() -> WorkerSetup {
    let script = r#"printf '{"type":"ready","pid":%d}\n' $$; read line; exec 1>&-; exec sleep 30"#;
    WorkerSetup::Exec(ExecCommand::new("sh").arg("-c").arg(script))
}

#[test]
fn test_lingering_workers_are_reaped_concurrently() {
    let pool = TaskPool::new(PoolConfig::new(2), lingering_worker()).unwrap();
    pool.start().unwrap();

    let started = Instant::now();
    let receivers: Vec<_> = (0..2).map(|i| submit(&pool, "echo", json!(i))).collect();
    for rx in &receivers {
        // No maintenance passes: the pipe EOF alone has to finish the job.
        match rx.recv_timeout(WAIT).unwrap() {
            Err(JobError::WorkerDied { reason, .. }) => {
                assert_eq!(reason, "killed by signal SIGKILL")
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    // Each lost worker gets a one second grace period; reaping them one
    // after the other would take twice that.
    assert!(started.elapsed() < Duration::from_millis(1_800));
    wait_until(&pool, |p| p.active_process_count() == 2);
}

#[test]
fn test_exec_workers_serve_jobs() {
    let setup = WorkerSetup::Exec(ExecCommand::new(env!("CARGO_BIN_EXE_procpool")).arg("worker"));
    let pool = TaskPool::new(PoolConfig::new(2), setup).unwrap();
    pool.start().unwrap();
    assert_eq!(pool.active_process_count(), 2);

    let receivers: Vec<_> = (0..4).map(|i| submit(&pool, "echo", json!(i))).collect();
    for (i, rx) in receivers.iter().enumerate() {
        assert_eq!(wait(&pool, rx), Ok(json!(i)));
    }
    pool.stop().unwrap();
}

#[test]
fn test_terminate_job_signals_worker() {
    let pool = start_pool(PoolConfig::new(1));
    let pid = pool.worker_pids()[0];
    let rx = submit(&pool, "sleep", sleep_args(10_000));

    pool.terminate_job(pid, Some(nix::sys::signal::Signal::SIGKILL))
        .unwrap();
    match wait(&pool, &rx) {
        Err(JobError::WorkerDied { reason, .. }) => {
            assert_eq!(reason, "killed by signal SIGKILL")
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_max_tasks_recycles_worker() {
    let pool = start_pool(PoolConfig::new(1).with_max_tasks_per_worker(2));

    let mut pids = Vec::new();
    for _ in 0..4 {
        let rx = submit(&pool, "pid", Value::Null);
        pids.push(wait(&pool, &rx).unwrap());
    }
    assert_eq!(pids[0], pids[1]);
    assert_ne!(pids[1], pids[2]);
    assert_eq!(pids[2], pids[3]);
}

#[test]
fn test_unbounded_admission_queues_jobs() {
    let pool = start_pool(PoolConfig::new(1));
    let receivers: Vec<_> = (0..5).map(|_| submit(&pool, "sleep", sleep_args(20))).collect();
    assert!(pool.pending_job_count() >= 4);
    for rx in &receivers {
        assert!(wait(&pool, rx).is_ok());
    }
}

#[test]
fn test_fail_fast_admission() {
    let pool = start_pool(PoolConfig::new(1).with_admission(Admission::FailFast));
    assert!(pool.info().put_guarded_by_semaphore);

    let rx = submit(&pool, "sleep", sleep_args(300));
    assert!(matches!(
        pool.submit(Job::new("echo", Value::Null), |_| {}),
        Err(PoolError::Backpressure)
    ));
    assert!(wait(&pool, &rx).is_ok());

    // The slot is free again.
    let rx = submit(&pool, "echo", json!(1));
    assert_eq!(wait(&pool, &rx), Ok(json!(1)));
}

#[test]
fn test_block_admission_times_out() {
    let pool = start_pool(PoolConfig::new(1).with_admission(Admission::Block {
        timeout: Some(Duration::from_millis(50)),
    }));
    let rx = submit(&pool, "sleep", sleep_args(500));

    let started = Instant::now();
    assert!(matches!(
        pool.submit(Job::new("echo", Value::Null), |_| {}),
        Err(PoolError::Backpressure)
    ));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(wait(&pool, &rx).is_ok());
}

#[test]
fn test_soft_timeout_must_be_below_hard() {
    let pool = start_pool(PoolConfig::new(1));
    let result = pool.submit_with(
        Job::new("echo", Value::Null),
        SubmitOptions::default()
            .soft_timeout(Duration::from_secs(2))
            .hard_timeout(Duration::from_secs(1)),
        |_| {},
    );
    assert!(matches!(result, Err(PoolError::Config(_))));
}

#[test]
fn test_initializer_failure_is_startup_error() {
    let runtime = WorkerRuntime::new(registry())
        .with_initializer(|_ctx| anyhow::bail!("database unavailable"));
    let pool = TaskPool::new(PoolConfig::new(2), WorkerSetup::Fork(runtime)).unwrap();

    match pool.start() {
        Err(PoolError::Startup { failed }) => {
            let ids: Vec<usize> = failed.iter().map(|(id, _)| *id).collect();
            assert_eq!(ids, vec![0, 1]);
            assert!(failed[0].1.contains("database unavailable"));
        }
        other => panic!("unexpected start result: {:?}", other),
    }
    assert!(!pool.did_start_ok());
    assert_eq!(pool.lifecycle(), Lifecycle::Stopped);
    assert_eq!(pool.active_process_count(), 0);
}

#[test]
fn test_forced_timeouts() {
    let pool = start_pool(PoolConfig::new(1));
    let (id, rx) = submit_with(
        &pool,
        "sleep",
        json!({"ms": 10_000, "honor_cancel": true}),
        SubmitOptions::default(),
    );

    // Give the worker time to pick the job up; the cancellation flag is reset
    // when a job starts.
    std::thread::sleep(Duration::from_millis(200));
    assert!(pool.on_soft_timeout(id));
    assert_eq!(pool.job_state(id), Some(JobState::SoftTimedOut));
    let outcome = wait(&pool, &rx).unwrap();
    assert_eq!(outcome["cancelled"], json!(true));

    let (id, rx) = submit_with(&pool, "sleep", sleep_args(10_000), SubmitOptions::default());
    assert!(pool.on_hard_timeout(id));
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(JobError::HardTimeout { .. })
    ));
    assert!(!pool.on_hard_timeout(id));
}

#[test]
fn test_info_and_timers() {
    let config = PoolConfig::new(2)
        .with_soft_timeout(Duration::from_secs(1))
        .with_hard_timeout(Duration::from_secs(2))
        .with_max_tasks_per_worker(10)
        .with_maintenance_interval(Duration::from_millis(250));
    let pool = start_pool(config);

    let info = pool.info();
    assert_eq!(info.max_concurrency, 2);
    assert_eq!(info.processes.len(), 2);
    assert_eq!(info.max_tasks_per_worker, Some(10));
    assert!(!info.put_guarded_by_semaphore);
    assert_eq!(
        pool.configured_timeouts(),
        (Some(Duration::from_secs(1)), Some(Duration::from_secs(2)))
    );
    let value = serde_json::to_value(&info).unwrap();
    assert_eq!(value["max_concurrency"], json!(2));

    let timers = pool.timers();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].name, "maintenance");
    assert_eq!(timers[0].interval, Duration::from_millis(250));
    timers[0].fire();

    drop(pool);
    // Holding only a weak reference, the timer outlives the pool harmlessly.
    timers[0].fire();
}

#[test]
fn test_ticker_drives_timeouts() {
    let pool = start_pool(
        PoolConfig::new(1).with_maintenance_interval(Duration::from_millis(20)),
    );
    let ticker = procpool::Ticker::spawn(pool.timers()).unwrap();

    let (_, rx) = submit_with(
        &pool,
        "sleep",
        sleep_args(10_000),
        SubmitOptions::default().hard_timeout(Duration::from_millis(100)),
    );
    // No manual maintenance: the ticker has to enforce the limit.
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(JobError::HardTimeout { .. })
    ));
    drop(ticker);
}

#[test]
fn test_callback_panic_does_not_break_pool() {
    let pool = start_pool(PoolConfig::new(1));
    pool.submit(Job::new("echo", Value::Null), |_| panic!("callback bug"))
        .unwrap();
    let rx = submit(&pool, "echo", json!("after"));
    assert_eq!(wait(&pool, &rx), Ok(json!("after")));
}
