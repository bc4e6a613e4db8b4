//! Error taxonomy and plain-text error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::PathBuf;

/// Error type carried by response bodies (upstream, interpreter or file streams)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type shared by every response the gateway produces
pub type GatewayBody = BoxBody<Bytes, BoxError>;

/// Error codes surfaced in the X-Gateway-Error header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Request path tried to leave the content root
    PathTraversal,
    /// Requested file does not exist
    NotFound,
    /// No handler is registered for the path
    RouteNotFound,
    /// Method is not accepted on this endpoint
    MethodNotAllowed,
    /// Range header cannot be satisfied for this file
    RangeNotSatisfiable,
    /// Directory disappeared between routing and listing
    DirectoryVanished,
    /// Directory could not be enumerated
    EnumerationFailed,
    /// PHP interpreter failed to run the script
    InterpreterFailed,
    /// PHP interpreter exceeded the execution timeout
    InterpreterTimeout,
    /// Upstream backend could not be reached
    UpstreamFailed,
    /// Upstream backend did not answer in time
    UpstreamTimeout,
    /// Internal gateway error
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::PathTraversal => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorCode::DirectoryVanished => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::EnumerationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InterpreterFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InterpreterTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::PathTraversal => "PATH_TRAVERSAL",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::RangeNotSatisfiable => "RANGE_NOT_SATISFIABLE",
            ErrorCode::DirectoryVanished => "DIRECTORY_VANISHED",
            ErrorCode::EnumerationFailed => "ENUMERATION_FAILED",
            ErrorCode::InterpreterFailed => "INTERPRETER_FAILED",
            ErrorCode::InterpreterTimeout => "INTERPRETER_TIMEOUT",
            ErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Errors raised while handling a single request.
///
/// None of these terminate the process; the dispatcher turns each one into
/// a response through [`GatewayError::into_response`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("path escapes the content root: {0}")]
    PathTraversal(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("no route registered for {0}")]
    RouteNotFound(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(hyper::Method),

    #[error("range not satisfiable for a file of {0} bytes")]
    RangeNotSatisfiable(u64),

    #[error("directory vanished before it could be listed: {}", .0.display())]
    DirectoryVanished(PathBuf),

    #[error("failed to read directory {}: {source}", .path.display())]
    Enumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("PHP execution failed: {0}")]
    Interpreter(String),

    #[error("PHP execution exceeded {0} seconds")]
    InterpreterTimeout(u64),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream did not answer within {0} seconds")]
    UpstreamTimeout(u64),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::PathTraversal(_) => ErrorCode::PathTraversal,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::RouteNotFound(_) => ErrorCode::RouteNotFound,
            GatewayError::MethodNotAllowed(_) => ErrorCode::MethodNotAllowed,
            GatewayError::RangeNotSatisfiable(_) => ErrorCode::RangeNotSatisfiable,
            GatewayError::DirectoryVanished(_) => ErrorCode::DirectoryVanished,
            GatewayError::Enumeration { .. } => ErrorCode::EnumerationFailed,
            GatewayError::Interpreter(_) => ErrorCode::InterpreterFailed,
            GatewayError::InterpreterTimeout(_) => ErrorCode::InterpreterTimeout,
            GatewayError::Upstream(_) => ErrorCode::UpstreamFailed,
            GatewayError::UpstreamTimeout(_) => ErrorCode::UpstreamTimeout,
            GatewayError::Io { .. } => ErrorCode::InternalError,
        }
    }

    /// Message shown to the client.
    ///
    /// Interpreter failures carry their diagnostic text so the script author
    /// can see what PHP reported. Filesystem paths are never echoed back.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::PathTraversal(_) => "Invalid path".to_string(),
            GatewayError::NotFound(_) => "404 page not found".to_string(),
            GatewayError::RouteNotFound(_) => "404 page not found".to_string(),
            GatewayError::MethodNotAllowed(_) => "Method not allowed".to_string(),
            GatewayError::RangeNotSatisfiable(_) => "Requested range not satisfiable".to_string(),
            GatewayError::DirectoryVanished(_) | GatewayError::Enumeration { .. } => {
                "Failed to list directory".to_string()
            }
            GatewayError::Interpreter(detail) => format!("Error executing PHP: {}", detail),
            GatewayError::InterpreterTimeout(secs) => {
                format!("PHP execution timed out after {} seconds", secs)
            }
            GatewayError::Upstream(_) => "Bad gateway".to_string(),
            GatewayError::UpstreamTimeout(secs) => {
                format!("Upstream timed out after {} seconds", secs)
            }
            GatewayError::Io { .. } => "Internal server error".to_string(),
        }
    }

    pub fn into_response(self) -> Response<GatewayBody> {
        let mut response = text_error_response(self.code(), self.public_message());
        if let GatewayError::RangeNotSatisfiable(len) = self {
            if let Ok(value) = hyper::header::HeaderValue::from_str(&format!("bytes */{}", len)) {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

/// Wrap a fully buffered body
pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Create a plain-text error response with X-Gateway-Error header
pub fn text_error_response(code: ErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(hyper::header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
