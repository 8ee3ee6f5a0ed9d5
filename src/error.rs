use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::router::RouteError;
use crate::translator::TranslateError;
use crate::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("unsupported endpoint: {method} {path}")]
    UnsupportedEndpoint { method: String, path: String },
    #[error("backend rejected request ({status})")]
    Rejected { status: StatusCode, body: Bytes },
    #[error("all backends failed: {last}")]
    Exhausted { last: String },
}

const EXHAUSTED_MESSAGE: &str = "all backends failed";

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Route(RouteError::Custom(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Route(_) => StatusCode::NOT_FOUND,
            Self::Translate(TranslateError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            Self::Translate(TranslateError::UnsupportedPair { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Translate(_) | Self::Upstream(_) | Self::Exhausted { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedEndpoint { .. } => StatusCode::NOT_FOUND,
            Self::Rejected { status, .. } => *status,
        }
    }

    /// Body sent to the client, always in the OpenAI error envelope.
    pub fn client_body(&self) -> Bytes {
        let (kind, code) = match self {
            Self::Config(_) => ("api_error", Some("config_error")),
            Self::Route(RouteError::Custom(_)) => ("api_error", Some("router_error")),
            Self::Route(_) => ("invalid_request_error", Some("route_not_found")),
            Self::Translate(TranslateError::InvalidRequest(_)) | Self::InvalidRequest { .. } => {
                ("invalid_request_error", None)
            }
            Self::Translate(_) | Self::Upstream(_) | Self::Exhausted { .. } => {
                ("api_error", Some("backend_error"))
            }
            Self::PayloadTooLarge { .. } => ("invalid_request_error", Some("request_too_large")),
            Self::UnsupportedEndpoint { .. } => {
                ("invalid_request_error", Some("unsupported_endpoint"))
            }
            Self::Rejected { body, .. } => return body.clone(),
        };
        match self {
            // Backend details stay in the logs.
            Self::Exhausted { .. } => openai_error_body(kind, code, EXHAUSTED_MESSAGE),
            _ => openai_error_body(kind, code, self),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiErrorDetail<'a> {
    message: String,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct OpenAiErrorResponse<'a> {
    error: OpenAiErrorDetail<'a>,
}

pub(crate) fn openai_error_value(
    kind: &str,
    code: Option<&str>,
    message: impl std::fmt::Display,
) -> serde_json::Value {
    let response = OpenAiErrorResponse {
        error: OpenAiErrorDetail {
            message: message.to_string(),
            kind,
            code,
        },
    };
    serde_json::to_value(response).unwrap_or(serde_json::Value::Null)
}

pub(crate) fn openai_error_body(
    kind: &str,
    code: Option<&str>,
    message: impl std::fmt::Display,
) -> Bytes {
    Bytes::from(openai_error_value(kind, code, message).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_json(err: &GatewayError) -> serde_json::Value {
        serde_json::from_slice(&err.client_body()).expect("error body json")
    }

    #[test]
    fn routing_failure_is_not_found() {
        let err = GatewayError::from(RouteError::NoMatch);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let body = body_json(&err);
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], "route_not_found");
    }

    #[test]
    fn exhaustion_is_bad_gateway_without_backend_details() {
        let err = GatewayError::Exhausted {
            last: "backend status 503: db-7.internal refused".to_string(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            err.to_string(),
            "all backends failed: backend status 503: db-7.internal refused"
        );
        let body = body_json(&err);
        assert_eq!(body["error"]["code"], "backend_error");
        assert_eq!(body["error"]["message"], "all backends failed");
    }

    #[test]
    fn rejected_body_is_forwarded_verbatim() {
        let err = GatewayError::Rejected {
            status: StatusCode::UNAUTHORIZED,
            body: Bytes::from_static(b"{\"error\":{\"message\":\"bad key\"}}"),
        };
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.client_body(),
            Bytes::from_static(b"{\"error\":{\"message\":\"bad key\"}}")
        );
    }

    #[test]
    fn invalid_request_omits_code() {
        let err = GatewayError::InvalidRequest {
            reason: "missing body".to_string(),
        };
        let body = body_json(&err);
        assert!(body["error"].get("code").is_none());
    }
}
