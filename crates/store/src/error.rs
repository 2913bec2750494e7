//! Error types for object store calls.

use std::io::ErrorKind;

/// Errors an object store client may raise.
///
/// Only [`StoreError::Service`] and transient I/O failures are worth
/// retrying; everything else describes a request that will fail the same
/// way again.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid resume handle: {0}")]
    InvalidHandle(String),

    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Service { .. } => true,
            Self::Io(e) => is_transient_io(e.kind()),
            _ => false,
        }
    }
}

/// I/O failures that indicate a broken connection rather than a bad request.
pub fn is_transient_io(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            StoreError::Service {
                status: 503,
                message: "busy".into()
            }
            .is_retryable()
        );
        assert!(StoreError::Io(std::io::Error::from(ErrorKind::ConnectionReset)).is_retryable());
        assert!(!StoreError::Io(std::io::Error::from(ErrorKind::PermissionDenied)).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
        assert!(!StoreError::PreconditionFailed("x".into()).is_retryable());
        assert!(!StoreError::AccessDenied("x".into()).is_retryable());
        assert!(!StoreError::BadRequest("x".into()).is_retryable());
    }
}
