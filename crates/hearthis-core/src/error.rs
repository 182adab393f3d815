use thiserror::Error;

/// Failure of a single page fetch.
///
/// `Clone` so a scope that ends in `Failed` can keep its cause around for
/// later inspection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The attempt did not complete within the per-attempt timeout.
    #[error("request timed out")]
    Timeout,

    /// DNS, TCP or TLS level failure before a response arrived.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server answered with a non-success status.
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// The body was not a JSON array of records or an object with a `data` array.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Every retry attempt failed; carries the cause of the last attempt.
    #[error("retries exhausted, last cause: {0}")]
    Exhausted(Box<FetchError>),

    /// The owning pagination run was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures worth another attempt: timeouts, connection
    /// errors and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::ConnectionFailed(_) => true,
            FetchError::HttpStatus(code) => (500..600).contains(code),
            _ => false,
        }
    }
}

/// Page cache I/O problems. Never fatal: callers fall back to a live fetch.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),
}

/// Errors reported by the playback collaborator or the queue itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// The collaborator could not load the stream locator.
    #[error("failed to load stream: {0}")]
    LoadFailed(String),

    /// play/pause/stop/volume/seek failed.
    #[error("transport command failed: {0}")]
    TransportFailed(String),

    /// `select` was given an index outside the active view.
    #[error("index {index} out of range for view of {len} tracks")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A playlist line that could not be decoded. Line numbers are 1-based.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed playlist line {0}")]
    LineMalformed(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::ConnectionFailed("reset".into()).is_retryable());
        assert!(FetchError::HttpStatus(503).is_retryable());
        assert!(!FetchError::HttpStatus(404).is_retryable());
        assert!(!FetchError::MalformedPayload("x".into()).is_retryable());
        assert!(!FetchError::Exhausted(Box::new(FetchError::Timeout)).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_exhausted_display_includes_cause() {
        let err = FetchError::Exhausted(Box::new(FetchError::HttpStatus(502)));
        assert_eq!(err.to_string(), "retries exhausted, last cause: HTTP status 502");
    }
}
