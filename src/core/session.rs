//! Interactive session loop
//!
//! A [`Session`] owns the pseudo terminal master and shuttles bytes between
//! it and the local terminal from a single thread:
//!
//! ```text
//! local input ──► EscapeDetector ──► pty master ──► remote shell
//! local output ◄──────────────────── pty master ◄──┘
//! ```
//!
//! Each iteration waits on `poll(2)` with a bounded timeout so child exit is
//! noticed even when both sides are quiet. Resize and termination signals
//! arrive as readable pipes in the same wait.
//!
//! Whatever ends the loop, shutdown runs once and in this order: stop
//! reading, stop the child, reap it, restore the terminal mode.

use std::fmt;
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use crossterm::queue;
use crossterm::style::{Print, PrintStyledContent, Stylize};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::read;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::pty::{PtyError, PtyProcess, PtyRead};
use super::signals::SignalPipe;
use super::winsize::WinsizeSync;
use crate::ui::escape::{help_text, EscapeAction, EscapeDetector};
use crate::ui::raw_mode::RawModeGuard;

/// Size of the buffer used for each read
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long the final drain waits for output still in flight
const DRAIN_SETTLE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Failed to read local input: {0}")]
    Input(#[source] nix::Error),

    #[error("Failed to write local output: {0}")]
    Output(#[source] io::Error),

    #[error("Failed to wait for I/O: {0}")]
    Poll(#[source] nix::Error),
}

/// Loop state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpState {
    Running,
    /// Child has exited, flushing what it left behind
    Draining,
    Terminated,
}

/// Why a session ended
#[derive(Debug)]
pub enum ExitReason {
    /// Operator typed the disconnect escape
    Disconnected,
    /// Remote shell exited with this code
    ChildExited(i32),
    /// PTY closed but the child kept running
    HangUp,
    /// Local input reached end of file
    InputClosed,
    /// The proxy received a termination signal
    Signaled,
    /// Unrecoverable I/O failure
    Io(SessionError),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Disconnected => write!(f, "disconnected by operator"),
            ExitReason::ChildExited(code) => write!(f, "remote shell exited with code {}", code),
            ExitReason::HangUp => write!(f, "pseudo terminal closed"),
            ExitReason::InputClosed => write!(f, "local input closed"),
            ExitReason::Signaled => write!(f, "terminated by signal"),
            ExitReason::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Tunables for a session
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Escape character; `None` forwards every byte untouched
    pub escape_char: Option<u8>,
    /// Upper bound on a single readiness wait
    pub poll_interval: Duration,
    /// SIGTERM to SIGKILL grace period for the child
    pub terminate_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            escape_char: Some(crate::ui::escape::DEFAULT_ESCAPE_CHAR),
            poll_interval: Duration::from_millis(100),
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// Which descriptors became ready in one wait
#[derive(Default)]
struct Readiness {
    input: bool,
    pty: bool,
    resize: bool,
    terminate: bool,
}

/// One attached terminal session
pub struct Session<'fd, W: Write> {
    pty: PtyProcess,
    input: BorrowedFd<'fd>,
    output: W,
    raw_mode: Option<RawModeGuard<'fd>>,
    winsize: Option<WinsizeSync<'fd>>,
    resize_signals: Option<SignalPipe>,
    term_signals: Option<SignalPipe>,
    escape: Option<EscapeDetector>,
    state: PumpState,
    options: SessionOptions,
}

impl<'fd, W: Write> Session<'fd, W> {
    /// Create a session reading operator input from `input` and writing the
    /// remote output to `output`
    pub fn new(pty: PtyProcess, input: BorrowedFd<'fd>, output: W, options: SessionOptions) -> Self {
        Self {
            pty,
            input,
            output,
            raw_mode: None,
            winsize: None,
            resize_signals: None,
            term_signals: None,
            escape: options.escape_char.map(EscapeDetector::new),
            state: PumpState::Running,
            options,
        }
    }

    /// Restore this terminal mode when the session ends
    pub fn with_raw_mode(mut self, guard: RawModeGuard<'fd>) -> Self {
        self.raw_mode = Some(guard);
        self
    }

    /// Keep the pty geometry in sync with a local terminal
    pub fn with_winsize(mut self, winsize: WinsizeSync<'fd>) -> Self {
        self.winsize = Some(winsize);
        self
    }

    /// Re-sync geometry whenever this pipe signals
    pub fn with_resize_signals(mut self, pipe: SignalPipe) -> Self {
        self.resize_signals = Some(pipe);
        self
    }

    /// End the session whenever this pipe signals
    pub fn with_termination_signals(mut self, pipe: SignalPipe) -> Self {
        self.term_signals = Some(pipe);
        self
    }

    #[allow(dead_code)]
    pub fn state(&self) -> PumpState {
        self.state
    }

    #[allow(dead_code)]
    pub fn pty(&self) -> &PtyProcess {
        &self.pty
    }

    #[allow(dead_code)]
    pub fn output(&self) -> &W {
        &self.output
    }

    /// Exit code of the child, once it has been reaped
    #[allow(dead_code)]
    pub fn child_exit(&mut self) -> Option<i32> {
        self.pty.poll_exit().ok().flatten()
    }

    /// Whether the local terminal is still in raw mode
    #[allow(dead_code)]
    pub fn raw_mode_active(&self) -> bool {
        self.raw_mode.as_ref().map_or(false, |g| g.is_active())
    }

    /// Pump bytes until the session ends, then clean up.
    pub fn run(&mut self) -> ExitReason {
        if self.state != PumpState::Running {
            return ExitReason::HangUp;
        }

        if let Some(winsize) = self.winsize.as_mut() {
            winsize.sync(&self.pty);
        }

        let reason = self.pump();
        info!("Session ended: {}", reason);

        self.shutdown();
        self.announce(&reason);
        reason
    }

    fn pump(&mut self) -> ExitReason {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match self.step(&mut buf) {
                Ok(Some(reason)) => return reason,
                Ok(None) => {}
                Err(e) => return ExitReason::Io(e),
            }
        }
    }

    /// One wait plus the work it made ready
    fn step(&mut self, buf: &mut [u8]) -> Result<Option<ExitReason>, SessionError> {
        let ready = self.wait_ready()?;

        if ready.terminate {
            if let Some(pipe) = self.term_signals.as_mut() {
                pipe.drain();
            }
            return Ok(Some(ExitReason::Signaled));
        }

        if ready.resize {
            if let Some(pipe) = self.resize_signals.as_mut() {
                pipe.drain();
            }
            if let Some(winsize) = self.winsize.as_mut() {
                winsize.sync(&self.pty);
            }
        }

        if ready.pty {
            if let Some(reason) = self.pump_output(buf)? {
                return Ok(Some(reason));
            }
        }

        if ready.input {
            if let Some(reason) = self.pump_input(buf)? {
                return Ok(Some(reason));
            }
        }

        if let Some(code) = self.pty.poll_exit()? {
            self.state = PumpState::Draining;
            self.drain_output(buf)?;
            return Ok(Some(ExitReason::ChildExited(code)));
        }

        Ok(None)
    }

    fn wait_ready(&self) -> Result<Readiness, SessionError> {
        let ready_flags =
            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
        let timeout_ms = self.options.poll_interval.as_millis().clamp(1, u16::MAX as u128) as u16;

        let mut fds = Vec::with_capacity(4);
        fds.push(PollFd::new(self.input, PollFlags::POLLIN));
        fds.push(PollFd::new(self.pty.master(), PollFlags::POLLIN));
        let resize_slot = self.resize_signals.as_ref().map(|pipe| {
            fds.push(PollFd::new(pipe.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });
        let term_slot = self.term_signals.as_ref().map(|pipe| {
            fds.push(PollFd::new(pipe.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });

        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(Readiness::default()),
            Ok(_) => {}
            Err(e) => return Err(SessionError::Poll(e)),
        }

        let is_ready = |slot: Option<usize>| {
            slot.and_then(|i| fds[i].revents())
                .map_or(false, |revents| revents.intersects(ready_flags))
        };

        Ok(Readiness {
            input: is_ready(Some(0)),
            pty: is_ready(Some(1)),
            resize: is_ready(resize_slot),
            terminate: is_ready(term_slot),
        })
    }

    /// Copy available child output to the local terminal
    fn pump_output(&mut self, buf: &mut [u8]) -> Result<Option<ExitReason>, SessionError> {
        match self.pty.read(buf)? {
            PtyRead::Data(n) => {
                write_local(&mut self.output, &buf[..n])?;
                Ok(None)
            }
            PtyRead::WouldBlock => Ok(None),
            PtyRead::Closed => self.hang_up().map(Some),
        }
    }

    /// The subordinate side closed; find out whether the child went with it
    fn hang_up(&mut self) -> Result<ExitReason, SessionError> {
        debug!("PTY closed by child");
        self.state = PumpState::Draining;
        match self.pty.wait_timeout(self.options.terminate_grace)? {
            Some(code) => Ok(ExitReason::ChildExited(code)),
            None => Ok(ExitReason::HangUp),
        }
    }

    /// Read operator input and forward it
    fn pump_input(&mut self, buf: &mut [u8]) -> Result<Option<ExitReason>, SessionError> {
        let n = loop {
            match read(self.input, buf) {
                // A terminal that went away reports EIO
                Ok(0) | Err(Errno::EIO) => return Ok(Some(ExitReason::InputClosed)),
                Ok(n) => break n,
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => return Ok(None),
                Err(e) => return Err(SessionError::Input(e)),
            }
        };
        self.forward_input(&buf[..n])
    }

    /// Run `data` through the escape detector and write the result to the pty
    fn forward_input(&mut self, data: &[u8]) -> Result<Option<ExitReason>, SessionError> {
        let Some(detector) = self.escape.as_mut() else {
            self.pty.write_all(data)?;
            return Ok(None);
        };

        let mut pending = Vec::with_capacity(data.len() + 1);
        for &byte in data {
            match detector.push(byte) {
                EscapeAction::Forward(b) => pending.push(b),
                EscapeAction::ForwardPair(introducer, b) => {
                    pending.push(introducer);
                    pending.push(b);
                }
                EscapeAction::Swallow => {}
                EscapeAction::ShowHelp => {
                    self.pty.write_all(&pending)?;
                    pending.clear();
                    write_local(&mut self.output, help_text(detector.introducer()).as_bytes())?;
                }
                EscapeAction::Disconnect => {
                    self.pty.write_all(&pending)?;
                    debug!("Disconnect escape received");
                    return Ok(Some(ExitReason::Disconnected));
                }
            }
        }

        self.pty.write_all(&pending)?;
        Ok(None)
    }

    /// Copy whatever the exited child left in the pty
    fn drain_output(&mut self, buf: &mut [u8]) -> Result<(), SessionError> {
        let mut deadline = Instant::now() + DRAIN_SETTLE;
        loop {
            match self.pty.read(buf)? {
                PtyRead::Data(n) => {
                    write_local(&mut self.output, &buf[..n])?;
                    deadline = Instant::now() + DRAIN_SETTLE;
                }
                PtyRead::Closed => return Ok(()),
                PtyRead::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(());
                    }
                    let timeout_ms = remaining.as_millis().clamp(1, u16::MAX as u128) as u16;
                    let mut fds = [PollFd::new(self.pty.master(), PollFlags::POLLIN)];
                    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                        Ok(0) => return Ok(()),
                        Ok(_) | Err(Errno::EINTR) => {}
                        Err(e) => return Err(SessionError::Poll(e)),
                    }
                }
            }
        }
    }

    /// Stop the child and give the terminal back. Runs at most once.
    fn shutdown(&mut self) {
        if self.state == PumpState::Terminated {
            return;
        }
        self.state = PumpState::Terminated;

        // No more signal-driven wakeups
        self.resize_signals = None;
        self.term_signals = None;

        match self.pty.terminate(self.options.terminate_grace) {
            Some(code) => debug!("Child {} finished with code {}", self.pty.pid(), code),
            None => warn!("Child {} ({}) could not be reaped", self.pty.pid(), self.pty.program()),
        }

        if let Some(mut guard) = self.raw_mode.take() {
            if let Err(e) = guard.release() {
                warn!("Failed to restore terminal mode: {}", e);
            }
        }
    }

    /// Tell the operator why the session ended
    fn announce(&mut self, reason: &ExitReason) {
        let notice = match reason {
            ExitReason::Disconnected => "Disconnected.".to_string(),
            ExitReason::Signaled => "Terminated.".to_string(),
            ExitReason::Io(e) => format!("Connection lost: {}", e),
            ExitReason::ChildExited(_) | ExitReason::HangUp | ExitReason::InputClosed => return,
        };

        let result = queue!(
            self.output,
            Print("\r\n"),
            PrintStyledContent(notice.bold()),
            Print("\r\n")
        )
        .and_then(|_| self.output.flush());
        if let Err(e) = result {
            debug!("Failed to print exit notice: {}", e);
        }
    }
}

impl<W: Write> Drop for Session<'_, W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn write_local<W: Write>(output: &mut W, data: &[u8]) -> Result<(), SessionError> {
    output.write_all(data).map_err(SessionError::Output)?;
    output.flush().map_err(SessionError::Output)
}
