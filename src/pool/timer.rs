//! Periodic timers and a background thread to drive them.

use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on how long the ticker sleeps before checking for shutdown.
const TICK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A named callback to run at a fixed interval.
#[derive(Clone)]
pub struct Timer {
    pub name: &'static str,
    pub interval: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl Timer {
    pub fn new<F>(name: &'static str, interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            name,
            interval,
            callback: Arc::new(callback),
        }
    }

    /// Run the callback once.
    pub fn fire(&self) {
        (self.callback)();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Background thread firing timers at their intervals until dropped.
///
/// The first firing of each timer happens one interval after spawning.
pub struct Ticker {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(timers: Vec<Timer>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let thread = thread::Builder::new()
            .name("procpool-ticker".to_string())
            .spawn(move || ticker_loop(timers, shutdown_clone))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the ticker thread and wait for it.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ticker_loop(timers: Vec<Timer>, shutdown: Arc<AtomicBool>) {
    tracing::debug!(timers = timers.len(), "Ticker thread started");

    let start = Instant::now();
    let mut due: Vec<Instant> = timers.iter().map(|t| start + t.interval).collect();

    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        for (timer, next) in timers.iter().zip(due.iter_mut()) {
            if now >= *next {
                tracing::trace!(timer = timer.name, "Firing timer");
                timer.fire();
                *next = Instant::now() + timer.interval;
            }
        }

        let sleep = due
            .iter()
            .map(|next| next.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(TICK_POLL_INTERVAL)
            .min(TICK_POLL_INTERVAL);
        thread::sleep(sleep);
    }

    tracing::debug!("Ticker thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_timer_fire() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let timer = Timer::new("count", Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.fire();
        timer.clone().fire();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(format!("{:?}", timer).contains("count"));
    }

    #[test]
    fn test_ticker_fires_until_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let timer = Timer::new("tick", Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let ticker = Ticker::spawn(vec![timer]).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        drop(ticker);

        let fired = calls.load(Ordering::SeqCst);
        assert!(fired >= 3, "timer fired only {} times", fired);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), fired);
    }
}
