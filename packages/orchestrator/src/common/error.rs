//! Structured error type shared by every subsystem.
//!
//! Each error carries a [`Kind`] so the queue engine's retry decider and the
//! HTTP surface can act on the class of failure without string matching.
//! Logging emits the kind, not the message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// Failure taxonomy. Retryability is a property of the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimited,
    DependencyUnavailable,
    DependencyTimeout,
    ResourceExhausted,
    IntegrityViolation,
    PolicyViolation,
    Internal,
    Shutdown,
}

impl Kind {
    /// Whether a job failing with this kind may be retried at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Kind::DependencyUnavailable
                | Kind::DependencyTimeout
                | Kind::ResourceExhausted
                | Kind::RateLimited
                | Kind::Internal
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Validation => "validation",
            Kind::Authentication => "authentication",
            Kind::Authorization => "authorization",
            Kind::NotFound => "not_found",
            Kind::Conflict => "conflict",
            Kind::RateLimited => "rate_limited",
            Kind::DependencyUnavailable => "dependency_unavailable",
            Kind::DependencyTimeout => "dependency_timeout",
            Kind::ResourceExhausted => "resource_exhausted",
            Kind::IntegrityViolation => "integrity_violation",
            Kind::PolicyViolation => "policy_violation",
            Kind::Internal => "internal",
            Kind::Shutdown => "shutdown",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Kind::Validation => StatusCode::BAD_REQUEST,
            Kind::Authentication => StatusCode::UNAUTHORIZED,
            Kind::Authorization => StatusCode::FORBIDDEN,
            Kind::NotFound => StatusCode::NOT_FOUND,
            Kind::Conflict => StatusCode::CONFLICT,
            Kind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Kind::DependencyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Kind::DependencyTimeout => StatusCode::GATEWAY_TIMEOUT,
            Kind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Kind::IntegrityViolation => StatusCode::UNPROCESSABLE_ENTITY,
            Kind::PolicyViolation => StatusCode::FORBIDDEN,
            Kind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Kind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: Kind,
    pub message: String,
    /// Domain error code consulted by retry policies (e.g.
    /// `network_timeout`, `invalid_workflow_configuration`). Falls back to
    /// the kind's name when unset.
    pub code: Option<String>,
    pub details: Option<serde_json::Value>,
    /// Hint for 429/503 responses, in seconds.
    pub retry_after: Option<u64>,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: None,
            retry_after: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(Kind::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(Kind::Authentication, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Kind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Kind::Conflict, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(Kind::DependencyUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// The code retry policies match against.
    pub fn code_str(&self) -> &str {
        self.code.as_deref().unwrap_or_else(|| self.kind.as_str())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::new(Kind::NotFound, "row not found"),
            sqlx::Error::PoolTimedOut => {
                Self::new(Kind::DependencyTimeout, "store connection pool timed out")
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::new(Kind::Conflict, "unique constraint violated")
            }
            _ => Self::new(Kind::DependencyUnavailable, err.to_string()),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::new(Kind::DependencyTimeout, err.to_string())
        } else {
            Self::new(Kind::DependencyUnavailable, err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(Kind::Validation, format!("malformed json: {err}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    timestamp: chrono::DateTime<Utc>,
    request_id: Uuid,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        tracing::warn!(kind = self.kind.as_str(), status = %status, "request failed");

        let body = Json(ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.kind.as_str(),
                message: self.message,
                details: self.details,
                timestamp: Utc::now(),
                request_id: Uuid::new_v4(),
            },
        });

        let mut response = (status, body).into_response();
        if let Some(seconds) = self.retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Kind::DependencyUnavailable.is_retryable());
        assert!(Kind::DependencyTimeout.is_retryable());
        assert!(Kind::ResourceExhausted.is_retryable());
        assert!(!Kind::Validation.is_retryable());
        assert!(!Kind::PolicyViolation.is_retryable());
        assert!(!Kind::IntegrityViolation.is_retryable());
    }

    #[test]
    fn kind_maps_to_status() {
        assert_eq!(Kind::Validation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Kind::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            Kind::DependencyUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn row_not_found_becomes_not_found() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind, Kind::NotFound);
    }
}
