// SPDX-License-Identifier: MPL-2.0

//! The `Tty` state: transparent passthrough with wake-word detection.
//!
//! stdin is put into raw mode via `nix::sys::termios` so bytes reach us one
//! at a time with no line discipline in the way, and both stdin and the link
//! are multiplexed with `mio`'s readiness polling rather than two blocking
//! threads, a single-threaded cooperative scheduling model.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::termios::{self, SetArg, Termios};

use crate::error::Result;
use crate::link::{Link, Mode};
use crate::state::{Emit, WakeDetector};

const STDIN_TOKEN: Token = Token(0);

/// How long a poll waits for stdin before giving the link's own
/// non-blocking read a turn. There is no readiness notification for the
/// `serialport` transport itself, so the link side is polled cooperatively
/// at this cadence instead.
const LINK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Saves the original terminal attributes on construction and restores them
/// on drop, so a panic, an error return, or a signal all leave the user's
/// shell in a sane state.
pub struct RawStdin {
    original: Termios,
}

impl RawStdin {
    pub fn enter() -> Result<Self> {
        let stdin = io::stdin();
        let original = termios::tcgetattr(stdin.as_fd())?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;
        Ok(RawStdin { original })
    }

    /// Restore the saved attributes. Safe to call ahead of `Drop`; `main.rs`
    /// drops the guard as soon as the SIGINT flag is observed so the restore
    /// happens before process exit either way.
    pub fn restore(&self) {
        let stdin = io::stdin();
        let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.original);
    }
}

impl Drop for RawStdin {
    fn drop(&mut self) {
        self.restore();
    }
}

impl From<nix::Error> for crate::error::Error {
    fn from(err: nix::Error) -> Self {
        crate::error::Error::Io(io::Error::from(err))
    }
}

/// Run the `Tty` state until the wake word is observed on the link, a
/// read/write error demotes the caller to `Reinit`, or `interrupted` is
/// raised by the SIGINT hook.
///
/// Bytes typed at stdin are written verbatim to the link. Bytes arriving on
/// the link are written to stdout, except for the three-break wake word.
/// Returns `true` on wake, `false` if interrupted first.
pub fn run(link: &mut Link<Box<dyn serialport::SerialPort>>, interrupted: &AtomicBool) -> Result<bool> {
    link.set_mode(Mode::NonBlocking);

    let mut poll = Poll::new()?;
    let stdin = io::stdin();
    let stdin_fd = stdin.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&stdin_fd), STDIN_TOKEN, Interest::READABLE)?;

    let mut events = Events::with_capacity(1);
    let mut detector = WakeDetector::new();
    let mut stdin_buf = [0u8; 256];
    let mut link_buf = [0u8; 256];
    let mut stdout = io::stdout();

    loop {
        if interrupted.load(Ordering::Relaxed) {
            return Ok(false);
        }

        poll.poll(&mut events, Some(LINK_POLL_INTERVAL))?;

        for event in events.iter() {
            if event.token() == STDIN_TOKEN && event.is_readable() {
                let n = read_available(&mut &stdin, &mut stdin_buf)?;
                if n > 0 {
                    link.write_bytes(&stdin_buf[..n])?;
                }
            }
        }

        let n = link.read_bytes(&mut link_buf)?;
        for &byte in &link_buf[..n] {
            match detector.feed(byte) {
                Emit::Bytes(bytes) => {
                    if !bytes.is_empty() {
                        stdout.write_all(&bytes)?;
                        stdout.flush()?;
                    }
                }
                Emit::Woke => return Ok(true),
            }
        }
    }
}

fn read_available<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    match reader.read(buf) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}
