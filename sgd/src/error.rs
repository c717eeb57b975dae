use std::{error::Error, fmt, io};

use comms::TransportErr;
use parameter_server::SizeMismatchErr;
use tokio::task::JoinError;

use crate::{checkpoint::CheckpointErr, gradient::DeviceId};

/// The sgd crate's result type.
pub type Result<T> = std::result::Result<T, SgdErr>;

/// Training failures.
///
/// Configuration errors are raised before the first training step. Aggregation
/// and transport errors are raised on every rank of the failing collective.
#[derive(Debug)]
pub enum SgdErr {
    InvalidConfig(String),
    Unsupported(&'static str),
    EmptyPackage,
    DeviceMismatch {
        expected: DeviceId,
        got: DeviceId,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    RankDisagreement(&'static str),
    Transport(TransportErr),
    Storage(SizeMismatchErr),
    Checkpoint(CheckpointErr),
    Task(JoinError),
    Io(io::Error),
}

impl fmt::Display for SgdErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SgdErr::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            SgdErr::Unsupported(what) => write!(f, "{what} is not supported"),
            SgdErr::EmptyPackage => f.write_str("the gradient package is empty"),
            SgdErr::DeviceMismatch { expected, got } => write!(
                f,
                "gradient buffers live on different devices: got {got}, expected {expected}"
            ),
            SgdErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "{what} size mismatch: got {got}, expected {expected}"),
            SgdErr::RankDisagreement(what) => write!(f, "ranks disagree on the {what}"),
            SgdErr::Transport(e) => write!(f, "transport error: {e}"),
            SgdErr::Storage(e) => write!(f, "parameter store error: {e}"),
            SgdErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            SgdErr::Task(e) => write!(f, "background aggregation failed: {e}"),
            SgdErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for SgdErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SgdErr::Transport(e) => Some(e),
            SgdErr::Storage(e) => Some(e),
            SgdErr::Checkpoint(e) => Some(e),
            SgdErr::Task(e) => Some(e),
            SgdErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportErr> for SgdErr {
    fn from(value: TransportErr) -> Self {
        Self::Transport(value)
    }
}

impl From<SizeMismatchErr> for SgdErr {
    fn from(value: SizeMismatchErr) -> Self {
        Self::Storage(value)
    }
}

impl From<CheckpointErr> for SgdErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<JoinError> for SgdErr {
    fn from(value: JoinError) -> Self {
        Self::Task(value)
    }
}

impl From<io::Error> for SgdErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<SgdErr> for io::Error {
    fn from(value: SgdErr) -> Self {
        match value {
            SgdErr::Io(e) => e,
            SgdErr::InvalidConfig(_) | SgdErr::Unsupported(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, value)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
