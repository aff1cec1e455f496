use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::messages::anthropic;

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Errors of the translation pipeline and backend calls, with appropriate
/// HTTP status codes.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Invalid request parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication against the worker node failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The worker does not serve the requested model.
    #[error("{0}")]
    ModelNotFound(String),

    /// The worker shed the request.
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        /// Message returned by the worker.
        message: String,
    },

    /// The worker returned an unexpected status.
    #[error("Worker API error ({status}): {message}")]
    WorkerApiError {
        /// HTTP status returned by the worker.
        status: u16,
        /// Body returned by the worker.
        message: String,
    },

    /// Network or connection error reaching the worker.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The worker did not respond within the request deadline.
    #[error("Upstream timed out after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    /// No worker node is currently eligible to serve requests.
    #[error("No eligible worker node available; retry shortly")]
    NoEligibleNode,

    /// A circuit breaker is open for the requested resource.
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    /// Internal server error. `Some` carries a worker-provided message that
    /// is safe to show; `None` means an internal failure whose details must
    /// not leak to clients.
    #[error("Internal server error")]
    InternalError(Option<String>),
}

impl LlmError {
    /// The HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectionError(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::NoEligibleNode | Self::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::WorkerApiError { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The Anthropic error type string for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::ModelNotFound(_) => "not_found_error",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::NoEligibleNode | Self::CircuitOpen(_) => "overloaded_error",
            Self::ConnectionError(_) | Self::UpstreamTimeout(_) | Self::WorkerApiError { .. } => "api_error",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::InternalError(Some(worker_message)) => worker_message.clone(),
            Self::InternalError(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Whether dispatching the same request to another node may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_)
                | Self::UpstreamTimeout(_)
                | Self::RateLimitExceeded { .. }
                | Self::WorkerApiError { status: 500..=599, .. }
        )
    }
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = anthropic::ErrorResponse::new(self.error_type(), self.client_message());

        (status, Json(body)).into_response()
    }
}

/// An [`LlmError`] paired with its Anthropic-format response body, for
/// handlers returning protocol-correct errors.
pub struct MessagesErrorResponse {
    status: StatusCode,
    body: anthropic::ErrorResponse,
}

impl From<LlmError> for MessagesErrorResponse {
    fn from(error: LlmError) -> Self {
        Self {
            status: error.status_code(),
            body: anthropic::ErrorResponse::new(error.error_type(), error.client_message()),
        }
    }
}

impl IntoResponse for MessagesErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_hides_details() {
        let error = LlmError::InternalError(None);
        insta::assert_snapshot!(error.client_message(), @"Internal server error");

        let error = LlmError::InternalError(Some("worker says: out of memory".to_string()));
        insta::assert_snapshot!(error.client_message(), @"worker says: out of memory");
    }

    #[test]
    fn overload_errors_map_to_503() {
        assert_eq!(LlmError::NoEligibleNode.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(LlmError::NoEligibleNode.error_type(), "overloaded_error");
        assert_eq!(
            LlmError::CircuitOpen("parsers".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(LlmError::ConnectionError("refused".to_string()).is_retryable());
        assert!(
            LlmError::WorkerApiError {
                status: 503,
                message: "busy".to_string()
            }
            .is_retryable()
        );
        assert!(!LlmError::InvalidRequest("bad".to_string()).is_retryable());
        assert!(!LlmError::AuthenticationFailed("nope".to_string()).is_retryable());
    }
}
