use sea_orm::error::DbErr;
use serde::Serialize;

/// Error taxonomy shared by all services.
///
/// `NotFound` and `Unauthorized` are kept distinct internally so callers can
/// log the real cause; [`ServiceError::for_client`] collapses them before the
/// error leaves the process, so an ownership mismatch is indistinguishable
/// from a missing record.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ServiceError {
    /// Collapse internal-only distinctions into the externally visible shape.
    pub fn for_client(self) -> ServiceError {
        match self {
            ServiceError::Unauthorized(_) => {
                ServiceError::NotFound("resource not found".to_string())
            }
            other => other,
        }
    }

    /// True for errors a caller may retry (dependency trouble, not bad input).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::DatabaseError(_)
                | ServiceError::CacheError(_)
                | ServiceError::QueueError(_)
                | ServiceError::ServiceUnavailable(_)
        )
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_collapses_to_not_found() {
        let err = ServiceError::Unauthorized("invoice owned by another user".into());
        match err.for_client() {
            ServiceError::NotFound(msg) => assert_eq!(msg, "resource not found"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn conflict_is_preserved_for_client() {
        let err = ServiceError::Conflict("invoice already paid".into());
        assert!(matches!(err.for_client(), ServiceError::Conflict(_)));
    }

    #[test]
    fn retryable_classification() {
        assert!(ServiceError::CacheError("down".into()).is_retryable());
        assert!(ServiceError::QueueError("down".into()).is_retryable());
        assert!(!ServiceError::ValidationError("bad".into()).is_retryable());
        assert!(!ServiceError::Conflict("state".into()).is_retryable());
    }
}
