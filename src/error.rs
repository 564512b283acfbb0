//! Error types for the dispatch service.

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown rate limiter: {0}")]
    UnknownLimiter(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the scheduling and worker-coordination core.
///
/// `PreconditionFailed` and `RateLimited` are expected under concurrency and
/// are recoverable by retrying or backing off. `ExhaustedRetries` and
/// `AuthenticationFailed` are meant for the operator or end user.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Rate limited on {name}, retry at {retry_at}")]
    RateLimited {
        name: String,
        retry_at: DateTime<Utc>,
    },

    #[error("Job {job_id} exhausted its retries after {attempts} attempts")]
    ExhaustedRetries { job_id: Uuid, attempts: u32 },

    #[error("Invalid API key")]
    AuthenticationFailed,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DispatchError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionFailed(reason.into())
    }

    /// Whether the caller can recover by retrying or backing off.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_) | Self::RateLimited { .. })
    }
}

/// Errors from the worker-side transport to the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Coordinator rejected {endpoint} with status {status}: {message}")]
    Rejected {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl TransportError {
    /// Whether the worker lost its claim (job reclaimed, finished elsewhere).
    pub fn is_claim_lost(&self) -> bool {
        match self {
            Self::Rejected { status, .. } => *status == 409 || *status == 404,
            Self::Dispatch(DispatchError::PreconditionFailed(_))
            | Self::Dispatch(DispatchError::NotFound { .. }) => true,
            _ => false,
        }
    }
}

/// Errors produced while generating a completion on the worker.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Model {model} not available")]
    ModelNotAvailable { model: String },

    #[error("Empty response from {provider}")]
    EmptyResponse { provider: String },
}

impl LlmError {
    /// Whether another attempt on the same worker may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::EmptyResponse { .. }
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
