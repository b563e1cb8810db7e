//! Signal notifications as pollable file descriptors
//!
//! Signals are routed through signal-hook's self-pipe so the session loop can
//! wait for them with the same `poll(2)` call it uses for terminal I/O. The
//! handler only writes a byte; all work happens in the loop.

use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use libc::c_int;
use signal_hook::low_level::{pipe, unregister};
use signal_hook::SigId;
use tracing::debug;

/// A set of signals that make a pipe readable when delivered
pub struct SignalPipe {
    reader: UnixStream,
    ids: Vec<SigId>,
}

impl SignalPipe {
    /// Route `signals` into a new pipe
    pub fn register(signals: &[c_int]) -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        let mut this = Self {
            reader,
            ids: Vec::with_capacity(signals.len()),
        };
        // On failure, Drop unregisters whatever was already hooked
        for &signal in signals {
            let id = pipe::register(signal, writer.try_clone()?)?;
            this.ids.push(id);
        }

        debug!("Registered signal pipe for {:?}", signals);
        Ok(this)
    }

    /// Consume pending notifications; true if any signal arrived
    pub fn drain(&mut self) -> bool {
        let mut buf = [0u8; 64];
        let mut received = false;
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return received,
                Ok(_) => received = true,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return received,
            }
        }
    }
}

impl AsFd for SignalPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            unregister(id);
        }
    }
}
