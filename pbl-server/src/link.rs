// SPDX-License-Identifier: MPL-2.0

//! The byte-duplex link to the on-board agent.
//!
//! Wraps the `serialport` crate behind a small struct with an explicit
//! `init`/mode step, where the "mode" is the blocking/non-blocking toggle
//! the state machine switches at documented boundaries.

use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// A non-blocking read never waits for data; any timeout is treated as "no
/// bytes available" rather than an error.
const NON_BLOCKING_READ_TIMEOUT: Duration = Duration::from_millis(0);

/// How long [`Link::read_byte`] sleeps between retries in [`Mode::Blocking`]
/// when the transport itself didn't block (the real serialport handle is
/// opened with a zero timeout and `Session` is generic over `T: Read +
/// Write`, so there's no way to retune an OS-level read timeout instead).
/// Keeps a blocking wait from busy-spinning a CPU core.
const BLOCKING_RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// The link's two read modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reads suspend until at least one byte is available.
    Blocking,
    /// Reads return zero bytes immediately if none are available.
    NonBlocking,
}

/// The byte-duplex channel to the agent.
///
/// `Link` owns the underlying transport and tracks which [`Mode`] it is
/// currently in, so the state machine can assert the invariant that a
/// completed transfer phase always restores [`Mode::NonBlocking`] before
/// re-entering TTY passthrough.
pub struct Link<T: Read + Write> {
    pub(crate) transport: T,
    mode: Mode,
}

impl Link<Box<dyn serialport::SerialPort>> {
    /// Open `device` as a character serial device at 115200 8N1, no flow
    /// control. Retries on failure are the caller's responsibility.
    pub fn open(device: &str) -> Result<Self> {
        let port = serialport::new(device, 115_200)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(NON_BLOCKING_READ_TIMEOUT)
            .open()
            .map_err(open_error)?;

        Ok(Link {
            transport: port,
            mode: Mode::NonBlocking,
        })
    }
}

fn open_error(err: serialport::Error) -> Error {
    use serialport::ErrorKind as SpErrorKind;
    let io_err = match err.kind {
        SpErrorKind::NoDevice => io::Error::new(ErrorKind::NotFound, err.description),
        SpErrorKind::Io(ErrorKind::PermissionDenied) => {
            io::Error::new(ErrorKind::PermissionDenied, err.description)
        }
        _ => io::Error::other(err.description),
    };
    Error::from(io_err)
}

impl<T: Read + Write> Link<T> {
    /// Wrap an already-open transport (used by tests with an in-memory
    /// duplex pair).
    pub fn from_transport(transport: T) -> Self {
        Link {
            transport,
            mode: Mode::NonBlocking,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch the link's read mode. In [`Mode::Blocking`],
    /// [`Link::read_byte`] retries with a short sleep
    /// rather than relying on the transport's own OS-level timeout, since
    /// `Session` only ever sees `T: Read + Write` generically and can't
    /// retune a concrete `serialport` handle.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Read exactly one byte, suspending in [`Mode::Blocking`] until one
    /// arrives, or returning `Ok(None)` immediately in [`Mode::NonBlocking`]
    /// if none is available.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.transport.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    if self.mode == Mode::Blocking {
                        std::thread::sleep(BLOCKING_RETRY_BACKOFF);
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    /// Block until exactly one byte is read, regardless of the current
    /// mode. Used by handshake steps, which always need a definite answer.
    pub fn read_byte_blocking(&mut self) -> Result<u8> {
        let saved = self.mode;
        self.mode = Mode::Blocking;
        let result = self.read_byte();
        self.mode = saved;
        result?.ok_or_else(|| Error::Io(io::Error::new(ErrorKind::UnexpectedEof, "link closed")))
    }

    /// Read whatever is currently available into `buf`, returning the
    /// number of bytes read (0 in [`Mode::NonBlocking`] if none are ready).
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.transport.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.transport.write_all(buf).map_err(Error::from)
    }

    pub fn write_u32_le(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&pbl_proto::wire::encode_u32_le(value))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory duplex pair standing in for the real serial transport,
    /// so the state-machine and framing tests never need real hardware.
    pub struct FakeTransport {
        pub inbound: VecDeque<u8>,
        pub outbound: Vec<u8>,
    }

    impl FakeTransport {
        pub fn new(inbound: Vec<u8>) -> Self {
            FakeTransport {
                inbound: inbound.into(),
                outbound: Vec::new(),
            }
        }
    }

    impl Read for FakeTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.inbound.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for FakeTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub type FakeLink = Link<FakeTransport>;

    #[test]
    fn read_byte_returns_none_when_empty_non_blocking() {
        let mut link = Link::from_transport(FakeTransport::new(vec![]));
        link.set_mode(Mode::NonBlocking);
        assert_eq!(link.read_byte().unwrap(), None);
    }

    #[test]
    fn read_byte_drains_queued_bytes() {
        let mut link = Link::from_transport(FakeTransport::new(vec![0x41, 0x42]));
        link.set_mode(Mode::NonBlocking);
        assert_eq!(link.read_byte().unwrap(), Some(0x41));
        assert_eq!(link.read_byte().unwrap(), Some(0x42));
        assert_eq!(link.read_byte().unwrap(), None);
    }

    #[test]
    fn write_bytes_round_trips() {
        let mut link = Link::from_transport(FakeTransport::new(vec![]));
        link.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(link.transport.outbound, vec![1, 2, 3]);
    }
}
