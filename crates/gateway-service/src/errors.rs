//! `GatewayError` (`spec.md` §7), paralleling the teacher crate's `LLMError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gateway_core::LLMError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("client disconnected")]
    ClientCancelled,
    #[error("LM backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("LM backend rejected the request: {0}")]
    BackendBadRequest(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

impl From<LLMError> for GatewayError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Unavailable(e) => GatewayError::BackendUnavailable(e),
            LLMError::ContextLengthExceeded(e) => GatewayError::BackendBadRequest(e),
            LLMError::BadRequest(e) => GatewayError::BackendBadRequest(e),
            LLMError::InvalidRequest(e) => GatewayError::MalformedRequest(e),
            LLMError::ResponseFormat { message, .. } => GatewayError::BackendUnavailable(message),
            LLMError::NotImplemented(e) => GatewayError::BackendUnavailable(e),
        }
    }
}

impl From<crate::tags::TagError> for GatewayError {
    fn from(err: crate::tags::TagError) -> Self {
        GatewayError::MalformedRequest(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            GatewayError::ClientCancelled => return StatusCode::OK.into_response(),
            GatewayError::BackendUnavailable(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            GatewayError::BackendBadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            GatewayError::MalformedRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
        };
        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type(&self),
            }
        }));
        (status, body).into_response()
    }
}

fn error_type(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::ClientCancelled => "client_cancelled",
        GatewayError::BackendUnavailable(_) => "backend_unavailable",
        GatewayError::BackendBadRequest(_) => "backend_bad_request",
        GatewayError::MalformedRequest(_) => "malformed_request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_unavailable_maps_to_502() {
        let err = GatewayError::BackendUnavailable("boom".to_string());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn malformed_request_maps_to_400() {
        let err = GatewayError::MalformedRequest("bad tag".to_string());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
