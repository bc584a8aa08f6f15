//! Process handle for worker subprocesses.
//!
//! Wraps a child process with its IPC channels. The read side can be detached
//! with [`Proc::take_reader`] once the startup handshake is done, so a
//! dedicated reader thread can block on it while the pool keeps writing.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

/// Handle to a worker subprocess with IPC channels.
pub struct Proc {
    pid: Pid,
    /// Writer for sending requests to the worker
    writer: LineWriter,
    /// Reader for receiving responses (None once handed to a reader thread)
    reader: Option<LineReader>,
    /// Whether the process has been reaped
    reaped: bool,
}

impl Proc {
    /// Create a process handle from its components.
    ///
    /// `to_worker` is the write end of the worker's request pipe and
    /// `from_worker` the read end of its response pipe.
    pub fn new(pid: Pid, to_worker: PipeFd, from_worker: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(to_worker),
            reader: Some(LineReader::new(from_worker)),
            reaped: false,
        }
    }

    /// Create from a spawned `std::process::Child`, taking its stdin/stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdout not captured".into()))?;

        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send a request to the worker.
    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        self.writer
            .write_line(&request.to_line())
            .map_err(|e| PoolError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Receive a response from the worker.
    ///
    /// Returns `None` if the worker closed its end (EOF).
    pub fn recv(&mut self) -> Result<Option<WorkResponse>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PoolError::Worker("Reader already detached".into()))?;
        read_response(reader)
    }

    /// Wait for the startup handshake and return the pid the worker reported.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<i32> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PoolError::Worker("Reader already detached".into()))?;

        if !reader.wait_readable(timeout)? {
            return Err(PoolError::Worker(format!(
                "no ready signal within {:?}",
                timeout
            )));
        }

        match read_response(reader)? {
            Some(WorkResponse::Ready { pid }) => Ok(pid),
            Some(WorkResponse::InitFailed { message }) => Err(PoolError::Worker(format!(
                "initializer failed: {}",
                message
            ))),
            Some(other) => Err(PoolError::Worker(format!(
                "unexpected response instead of ready: {:?}",
                other
            ))),
            None => Err(PoolError::Worker(
                "closed connection before ready".to_string(),
            )),
        }
    }

    /// Detach the response reader for use on another thread.
    pub fn take_reader(&mut self) -> Option<LineReader> {
        self.reader.take()
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        !matches!(self.try_wait(), Ok(Some(_)) | Err(_))
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => {
                // ECHILD: somebody else reaped it; either way it is gone.
                self.reaped = true;
                Err(PoolError::Worker(format!("waitpid failed: {}", e)))
            }
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.reaped = true;
                Ok(status)
            }
            Err(e) => {
                self.reaped = true;
                Err(PoolError::Worker(format!("waitpid failed: {}", e)))
            }
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| PoolError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| PoolError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()?;
        Ok(())
    }

    /// Gracefully stop the worker: send exit command, wait briefly, then kill if needed.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }

        let _ = self.send(&WorkRequest::Exit);

        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.try_wait() {
                Ok(Some(_)) | Err(_) => return Ok(()),
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            }
        }

        let _ = self.terminate();

        std::thread::sleep(Duration::from_millis(100));
        if let Ok(Some(_)) = self.try_wait() {
            return Ok(());
        }

        self.kill()
    }

    /// Block until the process is reaped, for use after it was signalled.
    pub fn reap(&mut self) -> Option<WaitStatus> {
        if self.reaped {
            return None;
        }
        self.wait().ok()
    }
}

fn read_response(reader: &mut LineReader) -> Result<Option<WorkResponse>> {
    match reader.read_line() {
        Ok(Some(line)) => WorkResponse::from_line(line)
            .map(Some)
            .map_err(|e| PoolError::Worker(format!("Invalid worker response: {}", e))),
        Ok(None) => Ok(None),
        Err(e) => Err(PoolError::Worker(format!(
            "Failed to receive from worker: {}",
            e
        ))),
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.terminate();
            std::thread::sleep(Duration::from_millis(10));

            if let Ok(Some(_)) = self.try_wait() {
                return;
            }

            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_proc_from_child() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn cat");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        assert!(proc.is_running());

        // cat echoes the exit request back and only stops on SIGTERM/EOF.
        proc.stop(Duration::from_millis(200)).expect("Failed to stop");
        assert!(!proc.is_running());
    }

    #[test]
    fn test_proc_terminate() {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sleep");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        assert!(proc.is_running());

        proc.terminate().expect("Failed to terminate");
        let status = proc.wait().expect("wait failed");
        assert!(matches!(
            status,
            WaitStatus::Signaled(_, Signal::SIGTERM, _)
        ));
        assert!(!proc.is_running());
    }

    #[test]
    fn test_wait_ready_times_out() {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sleep");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        let err = proc.wait_ready(Duration::from_millis(50)).unwrap_err();
        assert!(err.to_string().contains("no ready signal"));
        proc.kill().unwrap();
    }

    #[test]
    fn test_wait_ready_reads_handshake() {
        let child = Command::new("sh")
            .arg("-c")
            .arg(r#"echo '{"type":"ready","pid":42}'; exec sleep 60"#)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sh");

        let mut proc = Proc::from_child(child).expect("Failed to create Proc");
        assert_eq!(proc.wait_ready(Duration::from_secs(5)).unwrap(), 42);
        assert!(proc.take_reader().is_some());
        assert!(proc.recv().is_err());
        proc.kill().unwrap();
    }
}
