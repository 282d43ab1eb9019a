//! Maps `CanonicalError` to HTTP responses, the REST analogue of the
//! teacher's `tonic_status()` in `cedar_server.rs`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use canonical_error::{CanonicalError, CanonicalErrorCode};
use serde_json::json;

pub fn http_status(canonical_error: &CanonicalError) -> StatusCode {
    match canonical_error.code {
        CanonicalErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        CanonicalErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        CanonicalErrorCode::NotFound => StatusCode::NOT_FOUND,
        CanonicalErrorCode::AlreadyExists => StatusCode::CONFLICT,
        CanonicalErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
        CanonicalErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
        CanonicalErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        CanonicalErrorCode::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        CanonicalErrorCode::Aborted => StatusCode::CONFLICT,
        CanonicalErrorCode::OutOfRange => StatusCode::BAD_REQUEST,
        CanonicalErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        CanonicalErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        CanonicalErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        CanonicalErrorCode::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Thin wrapper so handlers can just `?` a `CanonicalError` and have Axum
/// turn it into a JSON error body with the right status code.
pub struct ApiError(pub CanonicalError);

impl From<CanonicalError> for ApiError {
    fn from(e: CanonicalError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0);
        let body = Json(json!({ "error": self.0.message }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
