use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Application-specific error types.
///
/// Variants above `DatabaseError` abort a whole bulk operation before any side
/// effect; per-item failures use [`GenerationError`] and [`DeliveryError`].
#[derive(Debug)]
pub enum AppError {
    /// Missing campaign/template, malformed request or unmet precondition.
    Validation(String),
    /// Cross-tenant access attempt.
    Ownership(String),
    /// Tenant or campaign lead ceiling reached.
    QuotaExceeded(String),
    /// Channel credentials rejected by `test_connection`.
    InvalidCredentials(String),
    /// An equivalent bulk job is already queued or running.
    Conflict(String),
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Error interacting with an external API.
    ExternalApiError(String),
    /// Internal server error.
    InternalError(String),
    /// Unauthorized access error.
    Unauthorized(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::Ownership(msg) => write!(f, "Ownership error: {}", msg),
            AppError::QuotaExceeded(msg) => write!(f, "Quota exceeded: {}", msg),
            AppError::InvalidCredentials(msg) => write!(f, "Invalid credentials: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Stable machine-readable kind, used in JSON bodies and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION",
            AppError::Ownership(_) => "OWNERSHIP",
            AppError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            AppError::InvalidCredentials(_) => "INVALID_CREDENTIALS",
            AppError::Conflict(_) => "CONFLICT",
            AppError::DatabaseError(_) => "DATABASE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ExternalApiError(_) => "EXTERNAL_API",
            AppError::InternalError(_) => "INTERNAL",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::WithContext { source, .. } => source.kind(),
        }
    }
}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    fn into_response(self) -> Response {
        let kind = self.kind();
        let (status, error_message) = match &self {
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Ownership(msg) => {
                tracing::warn!("Ownership violation: {}", msg);
                (StatusCode::FORBIDDEN, msg.clone())
            }
            AppError::QuotaExceeded(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
            AppError::InvalidCredentials(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                )
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
            "kind": kind,
        }));

        (status, body).into_response()
    }
}

impl Clone for AppError {
    /// Note: `sqlx::Error` is not cloneable, so `DatabaseError` is simplified to `RowNotFound` during cloning.
    fn clone(&self) -> Self {
        match self {
            AppError::Validation(msg) => AppError::Validation(msg.clone()),
            AppError::Ownership(msg) => AppError::Ownership(msg.clone()),
            AppError::QuotaExceeded(msg) => AppError::QuotaExceeded(msg.clone()),
            AppError::InvalidCredentials(msg) => AppError::InvalidCredentials(msg.clone()),
            AppError::Conflict(msg) => AppError::Conflict(msg.clone()),
            AppError::DatabaseError(_e) => AppError::DatabaseError(sqlx::Error::RowNotFound),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::ExternalApiError(msg) => AppError::ExternalApiError(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::Unauthorized(msg) => AppError::Unauthorized(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalError(format!("JSON (de)serialization failed: {}", err))
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::DatabaseError(e)),
            context: f(),
        })
    }
}

/// Failure of the shared generation resource for a single lead.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationError {
    /// Endpoint unreachable, queue closed or circuit open.
    Unavailable(String),
    /// The call did not complete within the configured timeout.
    Timeout(Duration),
    /// The endpoint refused the request (4xx).
    Rejected(String),
    /// The endpoint answered without usable text.
    EmptyResponse,
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::Unavailable(msg) => {
                write!(f, "generation resource unavailable: {}", msg)
            }
            GenerationError::Timeout(d) => {
                write!(f, "generation timed out after {}s", d.as_secs_f32())
            }
            GenerationError::Rejected(msg) => write!(f, "generation request rejected: {}", msg),
            GenerationError::EmptyResponse => write!(f, "generation returned no content"),
        }
    }
}

impl std::error::Error for GenerationError {}

/// Failure of a channel provider for a single delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Worth retrying: connection reset, provider 5xx, throttling.
    Transient(String),
    /// Never retried: invalid recipient, auth failure, rejected payload.
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            DeliveryError::Transient(msg) | DeliveryError::Permanent(msg) => msg,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Transient(msg) => write!(f, "transient delivery error: {}", msg),
            DeliveryError::Permanent(msg) => write!(f, "permanent delivery error: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_fast_errors_map_to_client_statuses() {
        assert_eq!(
            AppError::Validation("x".into()).into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::Ownership("x".into()).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::QuotaExceeded("x".into()).into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Conflict("x".into()).into_response().status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn context_keeps_underlying_kind() {
        let err: Result<(), AppError> = Err(AppError::Ownership("lead 1".into()));
        let wrapped = err.context("preflight").unwrap_err();
        assert_eq!(wrapped.kind(), "OWNERSHIP");
        assert_eq!(wrapped.to_string(), "preflight: Ownership error: lead 1");
        assert_eq!(wrapped.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn delivery_error_classification() {
        assert!(DeliveryError::Transient("503".into()).is_transient());
        assert!(!DeliveryError::Permanent("550".into()).is_transient());
        assert_eq!(DeliveryError::Permanent("bad rcpt".into()).reason(), "bad rcpt");
    }
}
