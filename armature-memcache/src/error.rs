//! Error types for memcache operations.
//!
//! Callers only ever see [`MemcacheError`], which has exactly two kinds:
//! the operation timed out, or it failed for some other reason. The
//! backend-level cause is kept as the error source for diagnostics.

use thiserror::Error;

/// Result type for cache operations.
pub type MemcacheResult<T> = Result<T, MemcacheError>;

/// Result type used at the underlying client boundary.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors returned by every [`MemcacheClient`](crate::MemcacheClient) operation.
#[derive(Debug, Error)]
pub enum MemcacheError {
    /// The operation did not complete within its time budget.
    #[error("Operation timeout")]
    Timeout,

    /// The operation failed at the protocol layer or was interrupted while waiting.
    #[error("Cache operation failed: {0}")]
    Operation(#[source] BackendError),
}

impl MemcacheError {
    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Operation(cause) => cause.is_connection_error(),
        }
    }

    /// The underlying cause, if any.
    pub fn cause(&self) -> Option<&BackendError> {
        match self {
            Self::Timeout => None,
            Self::Operation(cause) => Some(cause),
        }
    }
}

impl From<BackendError> for MemcacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout => Self::Timeout,
            other => Self::Operation(other),
        }
    }
}

/// Errors raised by an underlying client implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// I/O error talking to a server.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected protocol exchange.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error.
    #[error("Server error: {0}")]
    Server(String),

    /// The waiting task was cancelled or panicked before the server answered.
    #[error("Interrupted while waiting for a response: {0}")]
    Interrupted(String),

    /// The backend gave up waiting for a response.
    #[error("Timed out waiting for a response")]
    Timeout,

    /// A value could not be encoded or decoded.
    #[error("Transcoder error: {0}")]
    Transcode(#[from] TranscoderError),

    /// The client has been shut down.
    #[error("Client has been shut down")]
    Shutdown,

    /// The server owning the key is not reachable.
    #[error("Server unavailable: {0}")]
    Unavailable(String),

    /// Any other backend-specific failure.
    #[error("Memcached error: {0}")]
    Other(String),
}

impl BackendError {
    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_))
    }
}

#[cfg(feature = "memcached")]
impl From<memcache::MemcacheError> for BackendError {
    fn from(err: memcache::MemcacheError) -> Self {
        use memcache::MemcacheError as Raw;

        match err {
            Raw::IOError(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Self::Timeout
            }
            Raw::IOError(io) => Self::Io(io),
            pool @ Raw::PoolError(_) => Self::Unavailable(pool.to_string()),
            server @ (Raw::ServerError(_) | Raw::CommandError(_)) => {
                Self::Server(server.to_string())
            }
            other => Self::Other(other.to_string()),
        }
    }
}

/// Errors raised by value transcoders.
#[derive(Debug, Error)]
pub enum TranscoderError {
    /// Value could not be encoded.
    #[error("Serialization error: {0}")]
    Encode(String),

    /// Bytes could not be decoded into a value.
    #[error("Deserialization error: {0}")]
    Decode(String),
}
