use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the gateway, covering both the REST surface (ingestion,
/// health, upgrade) and the internal signals pumps/handlers use to decide
/// whether a connection stays open. See spec §7 for the trigger/disposition
/// table this mirrors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("invalid request body: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("message exceeds maximum size")]
    MessageTooLarge,

    #[error("maximum connections reached")]
    MaxConnectionsReached,

    #[error("send timed out")]
    SendTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("service is shutting down")]
    ServiceUnavailable,

    #[error("internal error")]
    Internal,
}

impl AppError {
    /// Stable machine-readable code, used both in HTTP bodies and in
    /// `{code, message}` WebSocket error frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "INVALID_FIELD",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::RateLimited => "RATE_LIMIT_EXCEEDED",
            AppError::MessageTooLarge => "MESSAGE_TOO_LARGE",
            AppError::MaxConnectionsReached => "MAX_CONNECTIONS_REACHED",
            AppError::SendTimeout => "SEND_TIMEOUT",
            AppError::ConnectionClosed => "CONNECTION_CLOSED",
            AppError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            AppError::Internal => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited | AppError::MaxConnectionsReached => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::MessageTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SendTimeout | AppError::ConnectionClosed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Internal => {
                tracing::error!("internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(json!({ "code": self.code(), "message": self.to_string() })),
        )
            .into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429_with_stable_code() {
        let response = AppError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AppError::RateLimited.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn max_connections_reached_maps_to_429() {
        let response = AppError::MaxConnectionsReached.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn service_unavailable_maps_to_503() {
        let response = AppError::ServiceUnavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn validation_maps_to_400() {
        let response = AppError::Validation("bad body".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unauthorized_maps_to_401() {
        let response = AppError::Unauthorized("missing secret".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
