//! HTTP mapping for engine errors.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use cf_core::error::AppError;
use serde::Serialize;

/// Wrapper that lets handlers return `AppError` with `?`.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: &'a str,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            AppError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Blocked | AppError::Forbidden | AppError::SelfUpvoteForbidden => {
                StatusCode::FORBIDDEN
            }
            AppError::NotFound(..) | AppError::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            AppError::QuotaExceeded { .. } | AppError::PaymentNotVerified(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            AppError::InvalidTransition { .. } | AppError::AlreadyVoted | AppError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), status = status.as_u16(), "request refused");
        }
        // Store and gateway causes are logged, not echoed.
        let message = match &self.0 {
            AppError::Unavailable(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        HttpResponse::build(status).json(ErrorBody {
            error: self.0.kind(),
            message: &message,
        })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
