use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

use crate::models::report_status::{ReportStatus, ReportTrigger, UserRole};

/// Error kinds shared by models and routes. Guard and validation failures
/// are values, not panics: a failing operation returns one of these and
/// leaves the report untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("INVALID_TRANSITION: {trigger} is not allowed from {from} as {role}")]
    InvalidTransition {
        from: ReportStatus,
        trigger: ReportTrigger,
        role: UserRole,
    },
    #[error("REPORT_LOCKED: content is read-only while status is {status}")]
    ReportLocked { status: ReportStatus },
    #[error("ALREADY_ASSIGNED: report is already taken by another reviewer")]
    AlreadyAssigned,
    #[error("VALIDATION_FAILED: {0}")]
    Validation(String),
    #[error("EXTRACTION_FAILED: {0}")]
    Extraction(String),
    #[error("GEOLOCATION_TIMEOUT: no live fix within {0} ms")]
    GeolocationTimeout(u64),
    #[error("UPLOAD_FAILED: {0}")]
    Upload(String),
    #[error("UNAUTHORIZED")]
    Unauthorized,
    #[error("{0}_NOT_FOUND")]
    NotFound(&'static str),
    #[error("DATABASE_ERROR: {0}")]
    Database(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidTransition { .. }
            | ApiError::ReportLocked { .. }
            | ApiError::Validation(_)
            | ApiError::Extraction(_)
            | ApiError::Upload(_) => StatusCode::BAD_REQUEST,
            ApiError::AlreadyAssigned => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::GeolocationTimeout(_) | ApiError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).body(self.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
