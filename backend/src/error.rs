use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::ErrorResponse;

use crate::model::{CacheError, LoadError};

/// Errors that fail a whole batch. Per-image problems never end up here.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error("Model failed to run due to limited resources")]
    ModelUnavailable,
    #[error("Insufficient resources to complete the request")]
    InsufficientResources,
    #[error("Internal server error")]
    Internal(String),
}

impl From<CacheError> for BatchError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::UnknownTask(task) => BatchError::UnknownTask(task),
            CacheError::Load {
                source: LoadError::ResourceExhausted,
                ..
            } => BatchError::InsufficientResources,
            CacheError::Load { .. } => BatchError::ModelUnavailable,
        }
    }
}

impl ResponseError for BatchError {
    fn status_code(&self) -> StatusCode {
        match self {
            BatchError::Validation(_) | BatchError::UnknownTask(_) => StatusCode::BAD_REQUEST,
            BatchError::ModelUnavailable | BatchError::InsufficientResources => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let BatchError::Internal(detail) = self {
            log::error!("Internal error while serving batch: {}", detail);
        }
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::TaskKind;
    use std::path::PathBuf;

    #[test]
    fn load_failures_map_to_generic_errors() {
        let missing = CacheError::Load {
            task: TaskKind::Mammogram,
            source: LoadError::NotFound(PathBuf::from("models/mammogram_model.pt")),
        };
        let err = BatchError::from(missing);
        assert!(matches!(err, BatchError::ModelUnavailable));
        assert_eq!(err.to_string(), "Model failed to run due to limited resources");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let oom = CacheError::Load {
            task: TaskKind::EyeDefect,
            source: LoadError::ResourceExhausted,
        };
        assert!(matches!(BatchError::from(oom), BatchError::InsufficientResources));
    }

    #[test]
    fn client_errors_are_bad_requests() {
        let err = BatchError::from(CacheError::UnknownTask("skin".into()));
        assert_eq!(err.to_string(), "Unknown task: skin");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            BatchError::Validation("no images uploaded".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BatchError::Internal("worker pool gone".into()).to_string(),
            "Internal server error"
        );
    }
}
