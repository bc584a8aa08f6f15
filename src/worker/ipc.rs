//! Buffered pipe primitives for parent/worker communication.
//!
//! Line-based I/O over raw pipe descriptors with EINTR handling, plus a
//! poll-based readiness check so the parent can bound how long it waits for
//! a worker's handshake.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Wrap an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create a connected `(read, write)` pair.
    pub fn pair() -> io::Result<(PipeFd, PipeFd)> {
        let (read_fd, write_fd) =
            nix::unistd::pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok((PipeFd::new(read_fd), PipeFd::new(write_fd)))
    }
}

impl From<OwnedFd> for PipeFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered line reader for IPC.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer)? {
            0 => Ok(None),
            _ => {
                if self.line_buffer.ends_with('\n') {
                    self.line_buffer.pop();
                }
                if self.line_buffer.ends_with('\r') {
                    self.line_buffer.pop();
                }
                Ok(Some(&self.line_buffer))
            }
        }
    }

    /// Wait until a read would not block, or until `timeout` elapses.
    ///
    /// Returns `true` when data (or EOF) is available.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // PollTimeout tops out at u16::MAX milliseconds; longer waits loop.
            let millis = remaining.as_millis().min(u16::MAX as u128) as u16;
            let mut fds = [PollFd::new(self.reader.get_ref().as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => {
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                }
                Ok(_) => return Ok(true),
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}
