use thiserror::Error;

/// Errors surfaced to the caller.
///
/// Configuration errors (bad block sizes, diagonals crossing the short side
/// of a micro-panel, more ways than threads) are not represented here: they
/// abort with a panic since no partial result is meaningful.
#[derive(Debug, Error)]
pub enum Error {
    #[error("matrix view does not fit its buffer: {0}")]
    Dims(DimsError),

    #[error("workspace exhausted: requested {requested} bytes, {available} available")]
    WorkspaceExhausted { requested: usize, available: usize },

    #[error("failed to allocate {bytes} bytes of workspace")]
    Alloc { bytes: usize },

    #[error("failed to start worker threads: {0}")]
    ThreadPool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DimsError {
    #[error("buffer too small, needs at least {0} elements")]
    BufferTooSmall(usize),
    #[error("offset computation overflows")]
    SizeOverflow,
}

impl From<DimsError> for Error {
    fn from(e: DimsError) -> Self {
        Error::Dims(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
