use thiserror::Error;

pub type ImagedResult<T> = Result<T, ImagedError>;

#[derive(Debug, Error)]
pub enum ImagedError {
    /// No valid line arrived before the deadline.
    #[error("timed out after {0}ms waiting for worker")]
    TransportTimeout(u64),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("worker process died: {0}")]
    ProcessDied(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("container expired at {0}")]
    Expired(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The worker answered with `success: false`.
    #[error("worker error: {0}")]
    Worker(String),

    /// Precondition violation, e.g. sending before the handshake completed.
    #[error("channel not ready: {0}")]
    NotReady(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportTimeout,
    Framing,
    AuthFailure,
    ProtocolViolation,
    ProcessDied,
    Format,
    Rejected,
    Internal,
}

impl ImagedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImagedError::TransportTimeout(_) => ErrorKind::TransportTimeout,
            ImagedError::Framing(_) => ErrorKind::Framing,
            ImagedError::AuthFailure(_) => ErrorKind::AuthFailure,
            ImagedError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            ImagedError::ProcessDied(_) => ErrorKind::ProcessDied,
            ImagedError::Format(_) => ErrorKind::Format,
            ImagedError::Expired(_) | ImagedError::InvalidRequest(_) | ImagedError::Worker(_) => {
                ErrorKind::Rejected
            }
            ImagedError::NotReady(_)
            | ImagedError::Config(_)
            | ImagedError::Io(_)
            | ImagedError::Other(_) => ErrorKind::Internal,
        }
    }

    /// True when the session must be torn down and re-established before the
    /// next exchange.
    pub fn requires_resupervision(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProcessDied | ErrorKind::ProtocolViolation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_death_requires_resupervision() {
        let err = ImagedError::ProcessDied("exit status 1".into());
        assert!(err.requires_resupervision());
    }

    #[test]
    fn timeout_keeps_session() {
        let err = ImagedError::TransportTimeout(10_000);
        assert!(!err.requires_resupervision());
        assert_eq!(err.to_string(), "timed out after 10000ms waiting for worker");
    }

    #[test]
    fn auth_failure_is_not_retried() {
        let err = ImagedError::AuthFailure("tag mismatch".into());
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert!(!err.requires_resupervision());
    }
}
