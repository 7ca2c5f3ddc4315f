use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create trace file '{}' ({})", .path.display(), .source.kind())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Stack of depth {0} exceeds the maximum of {}", crate::symbols::MAX_STACK_DEPTH)]
    StackTooDeep(usize),

    #[error("The trace was already finished")]
    Finished,

    #[error(
        "Encountered and IO error while writing the output stream ({})",
        .0.kind()
    )]
    Io(#[from] io::Error),
}
