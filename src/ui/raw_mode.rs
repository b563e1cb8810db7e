//! Raw mode for the local terminal
//!
//! [`RawModeGuard`] captures the terminal's termios settings, switches the
//! terminal to raw mode and puts the captured settings back when released or
//! dropped. The snapshot is restored at most once.

use std::os::fd::{AsFd, BorrowedFd};

use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::unistd::isatty;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum TerminalModeError {
    #[error("Not a terminal")]
    NotATerminal,

    #[error("Failed to read terminal attributes: {0}")]
    GetAttr(#[source] nix::Error),

    #[error("Failed to set terminal attributes: {0}")]
    SetAttr(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, TerminalModeError>;

/// Saved terminal configuration
#[derive(Clone, Debug)]
pub struct ModeSnapshot {
    termios: Termios,
}

impl ModeSnapshot {
    /// Capture the current configuration of `fd`
    pub fn capture<Fd: AsFd>(fd: Fd) -> Result<Self> {
        if !isatty(fd.as_fd()).unwrap_or(false) {
            return Err(TerminalModeError::NotATerminal);
        }
        let termios = tcgetattr(fd.as_fd()).map_err(TerminalModeError::GetAttr)?;
        Ok(Self { termios })
    }

    /// Write the captured configuration back to `fd`
    pub fn restore<Fd: AsFd>(&self, fd: Fd) -> Result<()> {
        tcsetattr(fd.as_fd(), SetArg::TCSANOW, &self.termios).map_err(TerminalModeError::SetAttr)
    }

    /// Raw-mode variant of this configuration
    fn to_raw(&self) -> Termios {
        let mut raw = self.termios.clone();
        cfmakeraw(&mut raw);
        raw
    }
}

/// Holds a terminal in raw mode until released
pub struct RawModeGuard<'fd> {
    fd: BorrowedFd<'fd>,
    snapshot: Option<ModeSnapshot>,
}

impl<'fd> RawModeGuard<'fd> {
    /// Save the terminal configuration of `fd` and switch it to raw mode
    pub fn acquire(fd: BorrowedFd<'fd>) -> Result<Self> {
        let snapshot = ModeSnapshot::capture(fd)?;

        if let Err(e) = tcsetattr(fd, SetArg::TCSANOW, &snapshot.to_raw()) {
            // tcsetattr may have applied part of the change
            let _ = snapshot.restore(fd);
            return Err(TerminalModeError::SetAttr(e));
        }

        debug!("Raw mode enabled");
        Ok(Self {
            fd,
            snapshot: Some(snapshot),
        })
    }

    /// Whether the snapshot is still waiting to be restored
    pub fn is_active(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Restore the saved configuration. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(snapshot) => {
                snapshot.restore(self.fd)?;
                debug!("Terminal mode restored");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for RawModeGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use nix::sys::termios::LocalFlags;

    fn same_settings(a: &Termios, b: &Termios) -> bool {
        a.input_flags == b.input_flags
            && a.output_flags == b.output_flags
            && a.control_flags == b.control_flags
            && a.local_flags == b.local_flags
            && a.control_chars == b.control_chars
    }

    #[test]
    fn test_acquire_and_release_restores_settings() {
        let pty = openpty(None, None).unwrap();
        let before = tcgetattr(&pty.slave).unwrap();

        let mut guard = RawModeGuard::acquire(pty.slave.as_fd()).unwrap();
        assert!(guard.is_active());

        let raw = tcgetattr(&pty.slave).unwrap();
        assert!(!raw.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw.local_flags.contains(LocalFlags::ECHO));
        assert!(!raw.local_flags.contains(LocalFlags::ISIG));

        guard.release().unwrap();
        assert!(!guard.is_active());

        let after = tcgetattr(&pty.slave).unwrap();
        assert!(same_settings(&before, &after));
    }

    #[test]
    fn test_release_is_idempotent() {
        let pty = openpty(None, None).unwrap();
        let mut guard = RawModeGuard::acquire(pty.slave.as_fd()).unwrap();
        guard.release().unwrap();
        guard.release().unwrap();
        drop(guard);
    }

    #[test]
    fn test_drop_restores_settings() {
        let pty = openpty(None, None).unwrap();
        let before = tcgetattr(&pty.slave).unwrap();
        {
            let _guard = RawModeGuard::acquire(pty.slave.as_fd()).unwrap();
        }
        let after = tcgetattr(&pty.slave).unwrap();
        assert!(same_settings(&before, &after));
    }

    #[test]
    fn test_snapshot_restore_without_change() {
        let pty = openpty(None, None).unwrap();
        let snapshot = ModeSnapshot::capture(&pty.slave).unwrap();
        snapshot.restore(&pty.slave).unwrap();
        let after = tcgetattr(&pty.slave).unwrap();
        assert!(same_settings(&snapshot.termios, &after));
    }

    #[test]
    fn test_not_a_terminal() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let result = RawModeGuard::acquire(read_end.as_fd());
        assert!(matches!(result, Err(TerminalModeError::NotATerminal)));
    }
}
