use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::messages::anthropic::ErrorResponse;

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Proxy errors with appropriate HTTP status codes.
///
/// Any of these reaching the client before the first SSE byte becomes a JSON
/// error body; after the first byte the stream degrades to an SSE `error`
/// event instead (the 200 status is already on the wire).
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request body failed to parse or violates the Messages schema.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Request body exceeded the configured size cap.
    #[error("Request body exceeds the configured limit of {0} bytes")]
    PayloadTooLarge(usize),

    /// Authentication required by the backend and missing from the request.
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Concurrency limit reached.
    #[error("Too many concurrent requests, try again later")]
    ConcurrencyExceeded,

    /// The backend could not be reached at all.
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The backend accepted the connection but exceeded a deadline.
    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    /// The backend replied with something we could not interpret.
    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    /// The backend returned a non-success HTTP status.
    #[error("Backend error ({status}): {message}")]
    BackendStatus {
        /// Upstream HTTP status.
        status: u16,
        /// Upstream error body.
        message: String,
    },

    /// No healthy cluster node is available.
    #[error("No healthy cluster node available")]
    NoHealthyNodes,

    /// The request was canceled before completion.
    #[error("Request canceled")]
    Canceled,

    /// Internal error. Some(message) came from upstream and can be shown;
    /// None must not leak details.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl ProxyError {
    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) | Self::PayloadTooLarge(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ConcurrencyExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendUnreachable(_) | Self::NoHealthyNodes => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendProtocol(_) => StatusCode::BAD_GATEWAY,
            Self::BackendStatus { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Canceled => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The Anthropic wire name for this error kind.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) | Self::PayloadTooLarge(_) => "invalid_request_error",
            Self::Unauthorized(_) => "authentication_error",
            Self::ConcurrencyExceeded => "rate_limit_error",
            Self::NoHealthyNodes => "overloaded_error",
            Self::BackendUnreachable(_)
            | Self::BackendTimeout(_)
            | Self::BackendProtocol(_)
            | Self::BackendStatus { .. }
            | Self::Canceled => "api_error",
            Self::Internal(_) => "api_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(upstream)) => upstream.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Map an upstream HTTP status + body to an error variant, the way the
    /// backends report open failures.
    pub fn from_upstream_status(status: u16, message: String) -> Self {
        match status {
            401 => Self::Unauthorized(message),
            _ => Self::BackendStatus { status, message },
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(self.error_type(), self.client_message());

        (status, Json(body)).into_response()
    }
}
