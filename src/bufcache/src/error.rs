use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("no space left on device")]
    NoSpace,
    #[error("I/O error")]
    Io,
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid block size {0}")]
    InvalidBlockSize(usize),
    #[error("out of memory")]
    OutOfMemory,
    #[error("buffers busy")]
    Busy,
    #[error("stale handle")]
    Stale,
}

impl From<blockio::DiskError> for CacheError {
    fn from(_: blockio::DiskError) -> Self {
        CacheError::Io
    }
}
