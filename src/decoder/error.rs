use crate::frame::{EventKind, FrameKind};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open trace file '{}' ({})", .path.display(), .source.kind())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{kind} frame declares {declared} bytes but {consumed} were read")]
    FrameLength {
        kind: FrameKind,
        declared: i64,
        consumed: u64,
    },

    #[error("{0} frame declares a negative size {1}")]
    NegativeSize(FrameKind, i64),

    #[error("{kind} event overruns its DATA frame by {overrun} bytes")]
    EventOverrun { kind: EventKind, overrun: i64 },

    #[error("Invalid name length {0}")]
    NameLength(i32),

    #[error("{kind} frame name of {len} bytes overruns the {remaining} bytes left in the frame")]
    NameOverrun {
        kind: FrameKind,
        len: usize,
        remaining: i64,
    },

    #[error(
        "Encountered and IO error while reading the input stream ({})",
        .0.kind()
    )]
    Io(#[from] io::Error),
}
