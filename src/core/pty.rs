//! Unix pseudo terminal wrapper
//!
//! This module opens a pseudo terminal pair and runs a child process with its
//! standard streams bound to the subordinate side. The parent keeps only the
//! master side, which is switched to non-blocking mode so the session loop can
//! drive it with `poll(2)`.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{read, write, Pid};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::winsize::WindowGeometry;

/// Interval between exit checks while waiting for the child
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0}")]
    Open(#[source] nix::Error),

    #[error("Failed to configure pseudo terminal: {0}")]
    Configure(#[source] nix::Error),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(#[source] nix::Error),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] nix::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] nix::Error),

    #[error("Failed to wait for child process: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Outcome of a non-blocking read from the master side
#[derive(Debug, PartialEq, Eq)]
pub enum PtyRead {
    /// Bytes were read into the buffer
    Data(usize),
    /// Nothing available right now
    WouldBlock,
    /// The subordinate side has been closed
    Closed,
}

/// A child process attached to a pseudo terminal
pub struct PtyProcess {
    master: OwnedFd,
    child: Child,
    program: String,
    exit: Option<i32>,
}

impl PtyProcess {
    /// Open a pseudo terminal and start `program` on it
    pub fn spawn<S: AsRef<str>>(
        program: &str,
        args: &[S],
        geometry: Option<WindowGeometry>,
    ) -> Result<Self> {
        let winsize = geometry.map(|g| g.to_winsize());
        let pair = openpty(winsize.as_ref(), None).map_err(PtyError::Open)?;

        // Neither side may leak into the child beyond its stdio
        set_cloexec(&pair.master)?;
        set_cloexec(&pair.slave)?;

        let spawn_err = |source: io::Error| PtyError::Spawn {
            program: program.to_string(),
            source,
        };

        let stdin = pair.slave.try_clone().map_err(spawn_err)?;
        let stdout = pair.slave.try_clone().map_err(spawn_err)?;

        let mut command = Command::new(program);
        command
            .args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(pair.slave));

        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        // The Command holds the last copies of the subordinate side; they are
        // closed in the parent when it goes out of scope.
        let child = command.spawn().map_err(spawn_err)?;
        drop(command);

        set_nonblocking(&pair.master)?;

        info!(
            "Spawned '{}' (pid {}) on pseudo terminal",
            program,
            child.id()
        );

        Ok(Self {
            master: pair.master,
            child,
            program: program.to_string(),
            exit: None,
        })
    }

    /// Master side of the pseudo terminal
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Check for child exit without blocking.
    ///
    /// Returns the exit code once the child has been reaped.
    pub fn poll_exit(&mut self) -> Result<Option<i32>> {
        if self.exit.is_none() {
            if let Some(status) = self.child.try_wait().map_err(PtyError::Wait)? {
                let code = exit_code(status);
                debug!("Child {} exited with code {}", self.child.id(), code);
                self.exit = Some(code);
            }
        }
        Ok(self.exit)
    }

    /// Whether the child is still running
    #[allow(dead_code)]
    pub fn is_running(&mut self) -> bool {
        matches!(self.poll_exit(), Ok(None))
    }

    /// Wait up to `timeout` for the child to exit on its own
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll_exit()? {
                return Ok(Some(code));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Stop the child: SIGTERM, then SIGKILL once `grace` has passed.
    ///
    /// Returns the exit code. Safe to call repeatedly; once the child has
    /// been reaped the cached code is returned.
    pub fn terminate(&mut self, grace: Duration) -> Option<i32> {
        if let Ok(Some(code)) = self.poll_exit() {
            return Some(code);
        }

        let pid = Pid::from_raw(self.child.id() as i32);
        debug!("Sending SIGTERM to child {}", pid);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }

        if let Ok(Some(code)) = self.wait_timeout(grace) {
            return Some(code);
        }

        warn!("Child {} did not exit after SIGTERM, killing", pid);
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => {
                let code = exit_code(status);
                self.exit = Some(code);
                Some(code)
            }
            Err(e) => {
                warn!("Failed to reap child {}: {}", pid, e);
                None
            }
        }
    }

    /// Non-blocking read of child output
    pub fn read(&self, buffer: &mut [u8]) -> Result<PtyRead> {
        loop {
            match read(&self.master, buffer) {
                Ok(0) => return Ok(PtyRead::Closed),
                Ok(n) => return Ok(PtyRead::Data(n)),
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => return Ok(PtyRead::WouldBlock),
                // Linux reports a closed subordinate side as EIO
                Err(Errno::EIO) => return Ok(PtyRead::Closed),
                Err(e) => return Err(PtyError::Read(e)),
            }
        }
    }

    /// Write all of `data` to the child, waiting while the pty buffer is full
    pub fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match write(&self.master, data) {
                Ok(n) => data = &data[n..],
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => {
                    let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLOUT)];
                    match poll(&mut fds, PollTimeout::from(100u16)) {
                        Ok(_) | Err(Errno::EINTR) => {}
                        Err(e) => return Err(PtyError::Write(e)),
                    }
                }
                Err(e) => return Err(PtyError::Write(e)),
            }
        }
        Ok(())
    }

    /// Set the pseudo terminal's geometry
    pub fn resize(&self, geometry: WindowGeometry) -> Result<()> {
        geometry.apply(&self.master).map_err(PtyError::Resize)
    }

    /// Current geometry of the pseudo terminal
    pub fn geometry(&self) -> Option<WindowGeometry> {
        WindowGeometry::read(&self.master)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.terminate(Duration::from_millis(500));
        }
    }
}

/// Map an exit status to a shell-style code
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        1
    }
}

fn set_cloexec<Fd: AsFd>(fd: &Fd) -> Result<()> {
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::Configure)?;
    Ok(())
}

fn set_nonblocking<Fd: AsFd>(fd: &Fd) -> Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).map_err(PtyError::Configure)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(PtyError::Configure)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collect child output until `needle` shows up or `timeout` passes
    fn read_until(pty: &PtyProcess, needle: &str, timeout: Duration) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let mut fds = [PollFd::new(pty.master(), PollFlags::POLLIN)];
            let _ = poll(&mut fds, PollTimeout::from(50u16));
            match pty.read(&mut buf) {
                Ok(PtyRead::Data(n)) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
                Ok(PtyRead::WouldBlock) => {}
                Ok(PtyRead::Closed) | Err(_) => break,
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_spawn_pty() {
        let pty = PtyProcess::spawn("/bin/sh", &["-c", "sleep 5"], None);
        assert!(pty.is_ok(), "Failed to spawn PTY: {:?}", pty.err());
        let mut pty = pty.unwrap();
        assert!(pty.is_running());
        assert!(pty.pid() > 0);
        assert_eq!(pty.program(), "/bin/sh");
        pty.terminate(Duration::from_millis(500));
    }

    #[test]
    fn test_spawn_missing_program() {
        let result = PtyProcess::spawn::<&str>("/nonexistent/thopter-shell-test", &[], None);
        assert!(matches!(result, Err(PtyError::Spawn { .. })));
    }

    #[test]
    fn test_child_has_controlling_terminal() {
        let pty = PtyProcess::spawn("/bin/sh", &["-c", "tty; sleep 1"], None).unwrap();
        let text = read_until(&pty, "/dev/", Duration::from_secs(3));
        assert!(text.contains("/dev/"), "Expected a tty path, got: {text}");
    }

    #[test]
    fn test_write_read_echo() {
        let mut pty = PtyProcess::spawn::<&str>("/bin/sh", &[], None).unwrap();
        pty.write_all(b"echo THOPTER_PTY_OK\n").unwrap();

        let text = read_until(&pty, "THOPTER_PTY_OK\r\n", Duration::from_secs(3));
        assert!(
            text.contains("THOPTER_PTY_OK"),
            "Expected output to contain THOPTER_PTY_OK, got: {text}"
        );
        pty.terminate(Duration::from_millis(500));
    }

    #[test]
    fn test_initial_geometry() {
        let mut pty = PtyProcess::spawn(
            "/bin/sh",
            &["-c", "sleep 5"],
            Some(WindowGeometry::new(30, 100)),
        )
        .unwrap();
        assert_eq!(pty.geometry(), Some(WindowGeometry::new(30, 100)));

        pty.resize(WindowGeometry::new(45, 160)).unwrap();
        assert_eq!(pty.geometry(), Some(WindowGeometry::new(45, 160)));
        pty.terminate(Duration::from_millis(500));
    }

    #[test]
    fn test_child_exit_code() {
        let mut pty = PtyProcess::spawn("/bin/sh", &["-c", "exit 3"], None).unwrap();
        let code = pty.wait_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(code, Some(3));
        assert!(!pty.is_running());
        assert_eq!(pty.poll_exit().unwrap(), Some(3));
    }

    #[test]
    fn test_terminate_running_child() {
        let mut pty = PtyProcess::spawn("/bin/sh", &["-c", "sleep 30"], None).unwrap();
        assert!(pty.is_running());

        let code = pty.terminate(Duration::from_secs(2));
        assert_eq!(code, Some(128 + libc::SIGTERM));
        assert!(!pty.is_running());

        // Second call returns the cached code
        assert_eq!(pty.terminate(Duration::from_secs(2)), code);
    }

    #[test]
    fn test_terminate_escalates_to_kill() {
        let mut pty = PtyProcess::spawn(
            "/bin/sh",
            &["-c", "trap '' TERM; echo armed; while :; do sleep 1; done"],
            None,
        )
        .unwrap();
        let text = read_until(&pty, "armed", Duration::from_secs(3));
        assert!(text.contains("armed"), "Trap was not installed: {text}");

        let code = pty.terminate(Duration::from_millis(200));
        assert_eq!(code, Some(128 + libc::SIGKILL));
    }

    #[test]
    fn test_read_reports_closed_after_exit() {
        let mut pty = PtyProcess::spawn("/bin/sh", &["-c", "echo bye"], None).unwrap();
        let text = read_until(&pty, "bye\r\n", Duration::from_secs(3));
        assert!(text.contains("bye"));

        assert_eq!(pty.wait_timeout(Duration::from_secs(3)).unwrap(), Some(0));

        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut closed = false;
        while Instant::now() < deadline {
            match pty.read(&mut buf).unwrap() {
                PtyRead::Closed => {
                    closed = true;
                    break;
                }
                PtyRead::Data(_) => {}
                PtyRead::WouldBlock => thread::sleep(Duration::from_millis(10)),
            }
        }
        assert!(closed, "Master side should report closure");
    }
}
