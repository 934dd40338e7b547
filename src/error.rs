use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::models::capability::CapabilityType;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid or missing client credentials")]
    Unauthenticated,

    #[error("Capability \"{0}\" is not enabled for this client")]
    CapabilityDisabled(CapabilityType),

    #[error("Model \"{0}\" is not available for this client")]
    ModelNotAllowed(String),

    #[error("Rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("{window} quota exceeded: {spent:.4} of {limit:.4} spent")]
    QuotaExceeded {
        window: &'static str,
        spent: f64,
        limit: f64,
    },

    #[error("No backend available after {attempts} attempt(s)")]
    NoAvailableBackend { attempts: usize },

    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::CapabilityDisabled(_) => "capability_disabled",
            AppError::ModelNotAllowed(_) => "model_not_allowed",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::NoAvailableBackend { .. } => "no_available_backend",
            AppError::NotFound => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_)
            | AppError::Sqlx(_)
            | AppError::Redis(_)
            | AppError::Anyhow(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::CapabilityDisabled(_) | AppError::ModelNotAllowed(_) => {
                StatusCode::FORBIDDEN
            }
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::NoAvailableBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_)
            | AppError::Sqlx(_)
            | AppError::Redis(_)
            | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            AppError::Sqlx(e) => {
                tracing::error!("Database error: {}", e);
                "Internal server error".to_string()
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                "Internal server error".to_string()
            }
            AppError::Anyhow(e) => {
                tracing::error!("Error: {}", e);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": { "kind": self.kind(), "message": self.public_message() }
        }));

        let mut response = (status, body).into_response();
        if let AppError::RateLimited { retry_after_secs } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs.max(1)),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_error_kinds() {
        let cap = CapabilityType::parse("text.generation").unwrap();
        let cases = [
            (AppError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AppError::CapabilityDisabled(cap), StatusCode::FORBIDDEN),
            (AppError::ModelNotAllowed("gpt".into()), StatusCode::FORBIDDEN),
            (
                AppError::RateLimited { retry_after_secs: 3 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                AppError::QuotaExceeded {
                    window: "daily",
                    spent: 1.0,
                    limit: 1.0,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                AppError::NoAvailableBackend { attempts: 2 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{}", err.kind());
        }
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let resp = AppError::RateLimited { retry_after_secs: 7 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "7");
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = AppError::Internal("db password leaked".into());
        assert_eq!(err.public_message(), "Internal server error");
    }
}
