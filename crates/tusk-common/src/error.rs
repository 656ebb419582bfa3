use thiserror::Error;

/// Top-level error type for the tusk storage engine.
/// Each variant corresponds to a distinct failure class surfaced
/// to callers of the buffer layer.
#[derive(Error, Debug)]
pub enum TuskError {
    /// Every frame in the pool is pinned; no eviction candidate exists.
    /// Transient: callers may back off and retry.
    #[error("buffer is full")]
    BufferFull,

    /// An I/O failure while reading or writing a specific page.
    #[error("io error on page {page_id}: {source}")]
    PageIo {
        page_id: u64,
        source: std::io::Error,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A programming error in the caller: invalid configuration or a
    /// handle that does not belong to this manager.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type TuskResult<T> = Result<T, TuskError>;
