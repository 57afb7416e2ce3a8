// SPDX-License-Identifier: MPL-2.0

//! Error types for the server state machine.
//!
//! Transfer-phase errors never abort the process; the state machine matches
//! on [`Error`] to decide whether to demote to `Reinit` or, for the handful
//! of truly unrecoverable cases (terminal setup, stdin setup, OOM), to
//! bubble up to `main` as a fatal [`anyhow::Error`].

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors observed while driving the server state machine.
#[derive(Debug)]
pub enum Error {
    /// The serial device does not exist yet; the caller retries with
    /// backoff instead of treating this as fatal.
    DeviceUnavailable(io::Error),
    /// Any other I/O failure on the link, a manifest file, or the kernel
    /// file. Demotes the state machine to `Reinit`.
    Io(io::Error),
    /// The agent replied with a byte other than the one the current phase
    /// expected.
    ProtocolViolation { expected: u8, got: u8 },
    /// The manifest file does not parse: wrong keyword, too many lines, or
    /// the file is simply too large.
    ManifestSyntax { line: usize, reason: &'static str },
    /// The manifest parses but a referenced file fails its checks (missing,
    /// empty, unreadable).
    ManifestSemantics { line: usize, reason: &'static str },
    /// The kernel file fails ELF validation.
    ElfInvalid(&'static str),
    /// A computed size exceeds a wire limit.
    SizeExceeded { limit: u32, actual: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DeviceUnavailable(e) => write!(f, "device unavailable: {e}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::ProtocolViolation { expected, got } => write!(
                f,
                "protocol violation: expected {expected:#04x}, got {got:#04x}"
            ),
            Error::ManifestSyntax { line, reason } => {
                write!(f, "config file line {line} {reason}")
            }
            Error::ManifestSemantics { line, reason } => {
                write!(f, "config file line {line} {reason}")
            }
            Error::ElfInvalid(reason) => write!(f, "invalid kernel image: {reason}"),
            Error::SizeExceeded { limit, actual } => {
                write!(f, "size {actual:#x} exceeds limit {limit:#x}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::DeviceUnavailable(err),
            io::ErrorKind::PermissionDenied => Error::DeviceUnavailable(err),
            _ => Error::Io(err),
        }
    }
}
