use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::AppError;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error rendered as `{"error": "..."}` with the mapped status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = StatusCode::from_u16(err.kind().status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %err, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %err, "Request rejected");
        }
        Self {
            status,
            message: err.user_message(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, StorageError};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::user("bad"), StatusCode::BAD_REQUEST),
            (
                AppError::from(StorageError::NotFound {
                    entity: "node",
                    id: "x".into(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::from(LlmError::NotConfigured {
                    message: "no key".into(),
                }),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::Timeout { timeout_ms: 60_000 },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                AppError::from(StorageError::Conflict {
                    message: "dup".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }

    #[test]
    fn test_cancelled_maps_to_499() {
        let err = ApiError::from(AppError::Cancelled);
        assert_eq!(err.status.as_u16(), 499);
        assert_eq!(err.message, "cancelled");
    }
}
