use std::{error::Error, fmt, io};

/// Checkpoint load and save failures.
///
/// Every variant is recoverable: the caller may fall back to an earlier
/// checkpoint or to a cold start.
#[derive(Debug)]
pub enum CheckpointErr {
    Io(io::Error),
    BadMagic,
    UnsupportedVersion(u32),
    /// The file ends before the record does.
    Truncated,
    Corrupt(String),
}

impl fmt::Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErr::Io(e) => write!(f, "io error: {e}"),
            CheckpointErr::BadMagic => f.write_str("not a checkpoint file"),
            CheckpointErr::UnsupportedVersion(v) => write!(f, "unsupported checkpoint version {v}"),
            CheckpointErr::Truncated => f.write_str("the checkpoint was not fully written"),
            CheckpointErr::Corrupt(msg) => write!(f, "corrupt checkpoint: {msg}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CheckpointErr {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof => Self::Truncated,
            _ => Self::Io(value),
        }
    }
}

impl From<serde_json::Error> for CheckpointErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Corrupt(value.to_string())
    }
}
