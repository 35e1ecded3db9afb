//! Error types shared across subsystems.

use thiserror::Error;

/// Error type for the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(err.to_string())
    }
}

/// Error type for LLM providers.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed ({provider}): {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<std::time::Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Error type for the ReAct engine.
///
/// Tool-level failures never surface here; they stay inside the conversation
/// as `<tool-error>` messages. An `EngineError` marks the whole run FAILED.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error type for the artifact store.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
