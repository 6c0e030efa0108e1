//! HTTP response building helpers
//!
//! Every JSON response uses one envelope:
//!
//! ```text
//! { "success": true,  "data": ... }
//! { "success": false, "error": "...", "code": "INSUFFICIENT_POINTS" }
//! ```

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Response, StatusCode};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::LedgerError;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

/// Wrap `data` in a success envelope
pub fn success<T: Serialize>(status: StatusCode, data: &T) -> Response<Full<Bytes>> {
    json_response(
        status,
        &serde_json::json!({ "success": true, "data": data }),
    )
}

/// 200 OK with a success envelope
pub fn ok<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    success(StatusCode::OK, data)
}

/// 201 Created with a success envelope
pub fn created<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    success(StatusCode::CREATED, data)
}

/// Failure envelope with an explicit status and code
pub fn failure(status: StatusCode, code: &str, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &serde_json::json!({ "success": false, "error": message, "code": code }),
    )
}

/// 404 for unknown routes
pub fn route_not_found() -> Response<Full<Bytes>> {
    failure(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found")
}

/// 405 for known paths with the wrong method
pub fn method_not_allowed() -> Response<Full<Bytes>> {
    failure(StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED", "Method not allowed")
}

/// Convert a LedgerError to an HTTP response.
///
/// Infrastructure failures are logged with their detail and shown to the
/// caller as a generic message.
pub fn error_response(err: LedgerError) -> Response<Full<Bytes>> {
    let status = err.status();

    if status.is_server_error() {
        error!(code = err.code(), error = %err, "Request failed");
    } else if matches!(err, LedgerError::Unauthorized(_) | LedgerError::Auth(_)) {
        warn!(code = err.code(), error = %err, "Request refused");
    }

    failure(status, err.code(), &err.user_message())
}

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, LedgerError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap a create result into an HTTP response with 201 Created
pub fn from_create_result<T: Serialize>(result: Result<T, LedgerError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e),
    }
}
