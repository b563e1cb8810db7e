//! Window size propagation
//!
//! Copies the local terminal's rows/columns onto the pseudo terminal so that
//! full-screen programs on the remote side render at the right size.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::pty::Winsize;
use tracing::debug;

use super::pty::PtyProcess;

nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// Terminal geometry in character cells
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowGeometry {
    pub rows: u16,
    pub cols: u16,
}

impl WindowGeometry {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Read the geometry of the terminal behind `fd`.
    ///
    /// Returns `None` if `fd` is not a terminal or reports a zero size.
    pub fn read<Fd: AsFd>(fd: Fd) -> Option<Self> {
        let mut ws = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: ws is a valid, writable winsize
        unsafe { tiocgwinsz(fd.as_fd().as_raw_fd(), &mut ws) }.ok()?;
        if ws.ws_row == 0 || ws.ws_col == 0 {
            return None;
        }
        Some(Self::new(ws.ws_row, ws.ws_col))
    }

    /// Apply this geometry to the terminal behind `fd`
    pub fn apply<Fd: AsFd>(&self, fd: Fd) -> nix::Result<()> {
        let ws = self.to_winsize();
        // SAFETY: ws lives for the duration of the call
        unsafe { tiocswinsz(fd.as_fd().as_raw_fd(), &ws) }.map(|_| ())
    }

    pub fn to_winsize(&self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl fmt::Display for WindowGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Keeps the pty geometry in step with the local terminal
pub struct WinsizeSync<'fd> {
    local: BorrowedFd<'fd>,
    last: Option<WindowGeometry>,
}

impl<'fd> WinsizeSync<'fd> {
    pub fn new(local: BorrowedFd<'fd>) -> Self {
        Self { local, last: None }
    }

    /// Last geometry pushed to the pty
    #[allow(dead_code)]
    pub fn last(&self) -> Option<WindowGeometry> {
        self.last
    }

    /// Copy the local geometry to `pty`.
    ///
    /// Failures are not fatal; returns `false` and waits for the next resize.
    pub fn sync(&mut self, pty: &PtyProcess) -> bool {
        let Some(geometry) = WindowGeometry::read(self.local) else {
            debug!("Local terminal size unavailable, skipping resize");
            return false;
        };

        match pty.resize(geometry) {
            Ok(()) => {
                if self.last != Some(geometry) {
                    debug!("PTY resized to {}", geometry);
                }
                self.last = Some(geometry);
                true
            }
            Err(e) => {
                debug!("Failed to resize PTY: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    #[test]
    fn test_read_back_applied_geometry() {
        let pty = openpty(None, None).unwrap();
        let geometry = WindowGeometry::new(40, 120);
        geometry.apply(&pty.master).unwrap();
        assert_eq!(WindowGeometry::read(&pty.slave), Some(geometry));
    }

    #[test]
    fn test_read_from_pipe_is_none() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        assert_eq!(WindowGeometry::read(&read_end), None);
    }

    #[test]
    fn test_zero_geometry_is_none() {
        let pty = openpty(None, None).unwrap();
        WindowGeometry::new(0, 0).apply(&pty.master).unwrap();
        assert_eq!(WindowGeometry::read(&pty.slave), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(WindowGeometry::new(24, 80).to_string(), "80x24");
    }

    #[test]
    fn test_sync_copies_local_geometry() {
        let local = openpty(None, None).unwrap();
        WindowGeometry::new(33, 101).apply(&local.master).unwrap();

        let mut pty = PtyProcess::spawn("/bin/sh", &["-c", "sleep 5"], None).unwrap();
        let mut winsize = WinsizeSync::new(local.slave.as_fd());

        assert!(winsize.sync(&pty));
        assert_eq!(winsize.last(), Some(WindowGeometry::new(33, 101)));
        assert_eq!(pty.geometry(), Some(WindowGeometry::new(33, 101)));

        // Local resize followed by another sync
        WindowGeometry::new(50, 132).apply(&local.master).unwrap();
        assert!(winsize.sync(&pty));
        assert_eq!(pty.geometry(), Some(WindowGeometry::new(50, 132)));

        pty.terminate(std::time::Duration::from_millis(500));
    }

    #[test]
    fn test_sync_without_terminal_is_skipped() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let mut pty = PtyProcess::spawn("/bin/sh", &["-c", "sleep 5"], None).unwrap();
        let mut winsize = WinsizeSync::new(read_end.as_fd());

        assert!(!winsize.sync(&pty));
        assert_eq!(winsize.last(), None);

        pty.terminate(std::time::Duration::from_millis(500));
    }
}
