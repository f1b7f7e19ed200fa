use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::StatusCode;

/// Client-facing error with the taxonomy's status and code mapping.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn auth_missing() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: "missing bearer token".to_string(),
        }
    }

    pub fn auth_bad_secret() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: "invalid client token".to_string(),
        }
    }

    pub fn no_token_available() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "no_token_available",
            message: "no credential available for upstream dispatch".to_string(),
        }
    }

    pub fn upstream_unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: "upstream rejected the credential; please retry".to_string(),
        }
    }

    pub fn upstream_rate_limited() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "rate_limited",
            message: "upstream rate limited; please slow down".to_string(),
        }
    }

    pub fn upstream_suspended() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "suspended",
            message: "credential temporarily suspended by upstream".to_string(),
        }
    }

    pub fn upstream_transport(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }

    pub fn body(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "error": {
                "message": self.message,
                "code": self.code,
            }
        }))
        .unwrap_or_default()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut resp = Response::new(Body::from(self.body()));
        *resp.status_mut() = self.status;
        resp.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        resp
    }
}
