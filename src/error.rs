//! API error taxonomy.
//!
//! Every handler failure maps to a numeric tag plus an HTTP status, and is
//! rendered as the standard JSON envelope with `success: false`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

/// Numeric error tags exposed in the `code` field of the envelope.
pub mod codes {
    pub const VALIDATION: u16 = 1001;
    pub const AUTHENTICATION: u16 = 1002;
    pub const AUTHORIZATION: u16 = 1003;
    pub const NOT_FOUND: u16 = 1004;
    pub const DATABASE: u16 = 2001;
    pub const NETWORK: u16 = 2002;
    pub const RATE_LIMIT: u16 = 3001;
    pub const INTERNAL: u16 = 5001;
}

/// An API-level error carrying the taxonomy tag and a user-facing message.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: u16,
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: codes::VALIDATION,
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            code: codes::AUTHENTICATION,
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn authorization() -> Self {
        Self {
            code: codes::AUTHORIZATION,
            status: StatusCode::UNAUTHORIZED,
            message: "未登录或会话已过期".to_string(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: codes::NOT_FOUND,
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn database() -> Self {
        Self {
            code: codes::DATABASE,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "数据库操作失败".to_string(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            code: codes::NETWORK,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            code: codes::RATE_LIMIT,
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
        }
    }

    pub fn internal() -> Self {
        Self {
            code: codes::INTERNAL,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "服务器内部错误".to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
            "code": self.code,
            "timestamp": Utc::now().to_rfc3339(),
        });

        (
            self.status,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body.to_string(),
        )
            .into_response()
    }
}
