//! Error taxonomy for the bridge core.
//!
//! Every surfaced error carries a machine-readable kind and a human-readable
//! message. Transient upstream conditions are retried before they reach this
//! type; validation and state-machine failures are never retried.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use snowbridge_shared::TicketTable;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Network failure or upstream 5xx that survived the retry budget.
    #[error("upstream request failed after {attempts} attempts: {message}")]
    TransientUpstream { attempts: u32, message: String },

    /// A second 401 after the one allowed credential refresh.
    #[error("upstream rejected credentials twice; refresh did not help")]
    AuthExpired,

    /// A specifically requested resource does not exist. 404s on record
    /// fetches are mapped to empty results before reaching this variant.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Malformed payload, unknown field path, or schema violation.
    #[error("validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// Disallowed state-machine edge on a mutating action.
    #[error("invalid {table} state transition from {from} to {to}")]
    InvalidTransition {
        table: TicketTable,
        from: String,
        to: String,
    },

    /// Internal or upstream throttling. Carries the source and when the
    /// window resets so callers can apply retry-after.
    #[error("rate limited by {rate_source}; resets in {reset_secs}s")]
    RateLimited { rate_source: String, reset_secs: u64 },

    /// Notification queue is at its configured capacity.
    #[error("notification queue at capacity ({capacity})")]
    QueueFull { capacity: usize },

    /// Circuit breaker is open for the upstream origin.
    #[error("circuit open for {origin}; retry after {cooldown_secs}s")]
    CircuitOpen { origin: String, cooldown_secs: u64 },

    /// Transport refused a new subscriber beyond its configured cap.
    #[error("{transport} at connection capacity ({limit})")]
    TransportFull { transport: &'static str, limit: usize },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event bus error: {0}")]
    EventBus(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel delivery failed via {channel}: {message}")]
    Delivery { channel: String, message: String },

    /// Store or event bus unreachable at startup, or another condition the
    /// service cannot run past.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientUpstream { .. } => "TRANSIENT_UPSTREAM",
            Self::AuthExpired => "AUTH_EXPIRED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::TransportFull { .. } => "TRANSPORT_FULL",
            Self::Database(_) => "DATABASE_ERROR",
            Self::EventBus(_) => "EVENT_BUS_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Delivery { .. } => "DELIVERY_FAILED",
            Self::Fatal(_) => "FATAL",
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Whether the upstream client may retry the operation inline.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientUpstream { .. })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Validation { .. } | Self::InvalidTransition { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::RateLimited { .. } | Self::QueueFull { .. } | Self::TransportFull { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::AuthExpired => StatusCode::BAD_GATEWAY,
            Self::TransientUpstream { .. } | Self::CircuitOpen { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.kind(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Self::RateLimited { reset_secs, .. } = &self {
            return (status, [("Retry-After", reset_secs.to_string())], Json(body))
                .into_response();
        }

        (status, Json(body)).into_response()
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
