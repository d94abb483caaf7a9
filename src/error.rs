use thiserror::Error;

/// Errors surfaced by the embedding and annotation services.
///
/// `NotFound` and `Conflict` are returned to callers untouched so they can
/// make their own retry decision. Nothing in this crate retries internally.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found")]
    NotFound,

    /// Stale version, or the record vanished between read and write.
    #[error("version conflict")]
    Conflict,

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Client faults: the request was rejected before touching any shared state.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ServiceError::NotFound
                | ServiceError::Conflict
                | ServiceError::InvalidId(_)
                | ServiceError::InvalidRequest(_)
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, ServiceError::Cancelled | ServiceError::DeadlineExceeded)
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Internal(e.into())
    }
}

impl From<r2d2::Error> for ServiceError {
    fn from(e: r2d2::Error) -> Self {
        ServiceError::Internal(e.into())
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Internal(anyhow::anyhow!("blocking task failed: {}", e))
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_client_faults() {
        assert!(ServiceError::Conflict.is_client_fault());
        assert!(ServiceError::InvalidId("x".into()).is_client_fault());
        assert!(!ServiceError::Upstream("boom".into()).is_client_fault());
        assert!(!ServiceError::Cancelled.is_client_fault());
    }

    #[test]
    fn internal_errors_keep_context() {
        let err: ServiceError = anyhow::anyhow!("disk full")
            .context("writing blob")
            .into();
        assert_eq!(err.to_string(), "internal error: writing blob: disk full");
    }
}
