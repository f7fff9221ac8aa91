//! One error boundary for the whole HTTP surface.
//!
//! Handlers return `Result<_, ApiError>`; the `IntoResponse` impl maps each
//! kind to its status and the `{error, message?}` JSON shape. Tokens never
//! appear in messages or logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::devices::model::DeviceError;
use crate::pairing::model::PairingError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("malformed request: {0}")]
    Malformed(String),
    /// Expired credential or pairing code — distinct message so the client
    /// knows re-pairing will help.
    #[error("expired: {0}")]
    Expired(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited")]
    RateLimited,
    /// Named orchestrator is not wired into this host.
    #[error("{0} unavailable")]
    UpstreamUnavailable(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Malformed(_) => StatusCode::BAD_REQUEST,
            ApiError::Expired(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Malformed(_) => "malformed",
            ApiError::Expired(_) => "expired",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimited => "rate_limited",
            ApiError::UpstreamUnavailable(_) => "upstream_unavailable",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internal errors are logged server-side and never echoed verbatim.
        let message = match &self {
            ApiError::Internal(e) => {
                error!(err = %e, "internal error");
                None
            }
            ApiError::Unauthorized | ApiError::RateLimited => None,
            other => Some(other.to_string()),
        };
        let body = match message {
            Some(m) => json!({ "error": self.code(), "message": m }),
            None => json!({ "error": self.code() }),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<DeviceError> for ApiError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Malformed => ApiError::Malformed("device token".to_string()),
            DeviceError::Expired => ApiError::Expired("device token expired".to_string()),
            // Unknown/mismatch/revoked all collapse to 401 — no token oracle.
            DeviceError::Unknown | DeviceError::Mismatch | DeviceError::Revoked => {
                ApiError::Unauthorized
            }
        }
    }
}

impl From<PairingError> for ApiError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::Unknown => ApiError::Malformed("pairing code rejected".to_string()),
            PairingError::Expired => ApiError::Expired("pairing code expired".to_string()),
            PairingError::Conflict => ApiError::Conflict("pairing code already used".to_string()),
            PairingError::Denied => ApiError::Forbidden("pairing denied".to_string()),
            PairingError::Cancelled => {
                ApiError::UpstreamUnavailable("pairing coordinator".to_string())
            }
        }
    }
}
