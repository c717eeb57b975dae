use std::{error::Error, fmt};

/// The comms module's result type.
pub type Result<T> = std::result::Result<T, TransportErr>;

/// Collective communication failures.
///
/// Every variant is raised on all ranks taking part in the failing collective,
/// no rank is left waiting on a peer that already gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportErr {
    LengthMismatch { round: u64, got: usize, expected: usize },
    InvalidRank { rank: usize, ranks: usize },
}

impl fmt::Display for TransportErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErr::LengthMismatch {
                round,
                got,
                expected,
            } => write!(
                f,
                "ranks disagree on the reduced buffer length at round {round}: got {got}, expected {expected}"
            ),
            TransportErr::InvalidRank { rank, ranks } => {
                write!(f, "rank {rank} is out of range for a cluster of {ranks} ranks")
            }
        }
    }
}

impl Error for TransportErr {}
