//! Core proxy components.
//!
//! - **pty**: pseudo terminal pair plus the child process running on it
//! - **winsize**: local-to-pty window size propagation
//! - **signals**: signal delivery as pollable descriptors
//! - **session**: the single-threaded loop tying them together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── PtyProcess (master fd + remote-attach child)
//! ├── WinsizeSync (local terminal -> pty geometry)
//! ├── SignalPipe (SIGWINCH, SIGTERM/SIGHUP/SIGINT)
//! ├── EscapeDetector (operator input filter)
//! └── RawModeGuard (local terminal mode)
//! ```

pub mod pty;
pub mod session;
pub mod signals;
pub mod winsize;
