//! Pipe primitives for owner/master communication.
//!
//! Newline-delimited frames over raw pipe fds, with EINTR handling. The
//! reader does its own framing so it works the same on blocking and
//! non-blocking descriptors.

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
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

impl IntoRawFd for PipeFd {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
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

/// Create a blocking pipe, returning `(read, write)`.
///
/// Both ends are close-on-exec; a forked child without `exec` still inherits them.
pub fn pipe() -> io::Result<(PipeFd, PipeFd)> {
    let to_io = |e: nix::errno::Errno| io::Error::from_raw_os_error(e as i32);
    let (r, w) = nix::unistd::pipe().map_err(to_io)?;
    for fd in [&r, &w] {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(to_io)?;
    }
    Ok((PipeFd::new(r), PipeFd::new(w)))
}

/// Create a one-way channel whose both ends are non-blocking, returning
/// `(read, write)`.
///
/// Backed by a Unix socket pair, which can be switched to non-blocking mode
/// portably.
pub fn nonblocking_channel() -> io::Result<(PipeFd, PipeFd)> {
    let (r, w) = UnixStream::pair()?;
    r.set_nonblocking(true)?;
    w.set_nonblocking(true)?;
    Ok((PipeFd::new(r.into()), PipeFd::new(w.into())))
}

/// Wait until `fd` is readable (or hung up).
///
/// `timeout_ms = None` blocks indefinitely. Returns `Ok(false)` on timeout or
/// when interrupted by a signal, so callers can re-check their state.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: Option<u16>) -> io::Result<bool> {
    let timeout = match timeout_ms {
        Some(ms) => PollTimeout::from(ms),
        None => PollTimeout::NONE,
    };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(fds[0].revents().is_some_and(|r| {
            r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
        })),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

/// Newline-framed reader.
pub struct LineReader {
    fd: PipeFd,
    buffer: Vec<u8>,
    eof: bool,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            buffer: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            eof: false,
        }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Whether the writing side has closed.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Perform one read into the internal buffer.
    ///
    /// Returns the number of bytes read; `Ok(0)` means EOF. On a non-blocking
    /// descriptor with nothing to read this fails with `WouldBlock`.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 8192];
        let n = self.fd.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    /// Read everything currently available without blocking.
    ///
    /// Only meaningful on a non-blocking descriptor.
    pub fn fill_available(&mut self) -> io::Result<()> {
        loop {
            match self.fill() {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Pop the next complete line from the buffer, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Blocking read of the next line. Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.next_line() {
                return Ok(Some(line));
            }
            if self.eof || self.fill()? == 0 {
                return Ok(None);
            }
        }
    }
}

/// Buffered line writer for a blocking descriptor.
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

/// Outgoing lines for a non-blocking descriptor.
///
/// Lines are queued in memory and written as far as the pipe accepts, so the
/// writer never stalls on a slow reader.
pub struct Outbox {
    fd: PipeFd,
    pending: Vec<u8>,
}

impl Outbox {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            fd,
            pending: Vec::new(),
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.pending.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            self.pending.push(b'\n');
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write as much as possible without blocking.
    pub fn flush_available(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.fd.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
