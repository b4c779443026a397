//! Error taxonomy and JSON error responses
//!
//! Every failure that can reach a client maps onto an [`ErrorCode`], which
//! fixes the HTTP status and the `X-Gateway-Error` header value. Store
//! failures are rendered with a generic message so internal error text never
//! leaves the process.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Errors produced by the stores, the authentication gate and the dispatch engine
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed input: bad hostname, bad target, missing field
    #[error("validation failed: {0}")]
    Validation(String),
    /// Uniqueness violation
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found")]
    NotFound,
    /// Bad credentials at token issuance
    #[error("invalid credentials")]
    Unauthorized,
    /// Missing, expired or forged bearer token
    #[error("authentication required")]
    Unauthenticated,
    /// Backend dial or handshake failure
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Underlying persistence failure
    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        GatewayError::Conflict(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Validation(_) => ErrorCode::ValidationError,
            GatewayError::Conflict(_) => ErrorCode::Conflict,
            GatewayError::NotFound => ErrorCode::NotFound,
            GatewayError::Unauthorized => ErrorCode::Unauthorized,
            GatewayError::Unauthenticated => ErrorCode::Unauthenticated,
            GatewayError::UpstreamUnavailable(_) => ErrorCode::UpstreamUnavailable,
            GatewayError::Store(_) => ErrorCode::InternalError,
        }
    }

    /// Message that is safe to show to a client
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Validation(msg) => msg.clone(),
            GatewayError::Conflict(msg) => msg.clone(),
            GatewayError::NotFound => "Resource not found".to_string(),
            GatewayError::Unauthorized => "Invalid credentials".to_string(),
            GatewayError::Unauthenticated => "Authentication required".to_string(),
            GatewayError::UpstreamUnavailable(_) => "Upstream unavailable".to_string(),
            GatewayError::Store(_) => "Internal error".to_string(),
        }
    }

    /// Convert this error into a JSON response
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.public_message())
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::Store(err.to_string())
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

/// Error codes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Conflict,
    NotFound,
    MethodNotAllowed,
    Unauthorized,
    Unauthenticated,
    /// Request carried no usable Host header
    MissingHost,
    /// No enabled record for the routing key
    NoRoute,
    UpstreamUnavailable,
    UpstreamTimeout,
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::MissingHost => StatusCode::BAD_GATEWAY,
            ErrorCode::NoRoute => StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::MissingHost => "MISSING_HOST",
            ErrorCode::NoRoute => "NO_ROUTE",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Gateway-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
