//! API error types and HTTP status mapping.

use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use echofs_cluster::ClusterError;

/// API-facing errors for the controller admin surface.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed request (bad mode, bad hint, missing field)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown object, chunk, or conflict
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Request conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Replication cannot serve the request right now
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Anything else
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// JSON body for error responses.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        })
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(what) => Self::NotFound(what),
            ClusterError::Core(echofs_core::CoreError::ObjectNotFound(what)) => {
                Self::NotFound(what)
            }
            ClusterError::Core(echofs_core::CoreError::UnknownConflict(id)) => {
                Self::NotFound(id.to_string())
            }
            ClusterError::Core(
                core @ (echofs_core::CoreError::InvalidMode(_)
                | echofs_core::CoreError::InvalidHint(_)),
            ) => Self::BadRequest(core.to_string()),
            ClusterError::Config(detail) => Self::BadRequest(detail),
            err @ (ClusterError::QuorumFailed { .. }
            | ClusterError::InsufficientReplicas { .. }
            | ClusterError::NoReplicas
            | ClusterError::AllReplicasDown(_)
            | ClusterError::Timeout(_)
            | ClusterError::ControllerUnavailable(_)) => Self::ServiceUnavailable(err.to_string()),
            err => Self::Internal(err.to_string()),
        }
    }
}

impl From<echofs_core::CoreError> for ApiError {
    fn from(err: echofs_core::CoreError) -> Self {
        ApiError::from(ClusterError::Core(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        use actix_web::http::StatusCode;

        let err: ApiError = ClusterError::NotFound("obj1".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: ApiError = ClusterError::QuorumFailed {
            acked: 1,
            required: 2,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError =
            ClusterError::Core(echofs_core::CoreError::InvalidHint("nope".into())).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
