//! Mapping of engine errors onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use fluxseries_core::SeriesError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub reason: String,
}

/// Error returned by handlers, rendered as `{"error", "reason"}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub reason: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, reason: String) -> Self {
        Self {
            status,
            error: error.to_string(),
            reason,
        }
    }

    pub fn bad_request(reason: String) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", reason)
    }

    pub fn internal(reason: String) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", reason)
    }
}

impl From<SeriesError> for ApiError {
    fn from(err: SeriesError) -> Self {
        let status = match &err {
            SeriesError::NotFound(_) => StatusCode::NOT_FOUND,
            SeriesError::Validation(_)
            | SeriesError::InvalidKey(_)
            | SeriesError::Json(_)
            | SeriesError::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
            SeriesError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SeriesError::AlreadyClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.error,
                reason: self.reason,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SeriesError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (SeriesError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (SeriesError::InvalidKey("x".into()), StatusCode::BAD_REQUEST),
            (SeriesError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (SeriesError::AlreadyClosed, StatusCode::SERVICE_UNAVAILABLE),
            (SeriesError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }

        let err = ApiError::from(SeriesError::NotFound("cpu".into()));
        assert_eq!(err.error, "not_found");
        assert!(err.reason.contains("cpu"));
    }
}
