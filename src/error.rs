//! Error types for the nimbus core
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation. Every
//! boundary failure (backend, embedding, storage, dispatch) is converted to a
//! typed variant before it reaches the orchestrator.

use thiserror::Error;

/// Failure modes of the language-model backend boundary
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend rejected the request due to rate limiting
    #[error("Backend rate limited: {0}")]
    RateLimited(String),

    /// The backend returned a response the core could not interpret
    #[error("Malformed backend response: {0}")]
    Malformed(String),

    /// Transport-level failure talking to the backend
    #[error("Backend transport error: {0}")]
    Transport(String),

    /// The backend did not answer within the per-call timeout
    #[error("Backend timed out after {0}ms")]
    Timeout(u64),
}

/// Main error type for nimbus operations
#[derive(Error, Debug)]
pub enum NimbusError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Language-model backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Embedding generation failed or timed out; retrieval degrades to lexical
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Stored vectors and the active embedder disagree on dimensionality.
    /// Changing the embedding model requires an explicit re-embedding pass.
    #[error("Embedding dimension mismatch: store has {stored}, embedder produces {produced}")]
    EmbeddingDimensionMismatch { stored: usize, produced: usize },

    /// Memory entry not found by direct id lookup
    #[error("Memory entry not found: {0}")]
    MemoryNotFound(String),

    /// The memory store cannot be reached; the agent path proceeds stateless
    #[error("Memory store unavailable: {0}")]
    MemoryStoreUnavailable(String),

    /// The backend requested a tool the dispatcher does not know.
    /// Same class as a classification ambiguity: surfaced, never a crash.
    #[error("Unknown tool requested: {0}")]
    UnknownTool(String),

    /// A tool call failed at the provider boundary
    #[error("Tool dispatch failed ({kind}): {message}")]
    Dispatch {
        kind: crate::types::DispatchErrorKind,
        message: String,
    },

    /// The current turn was cancelled by a user interrupt
    #[error("Turn cancelled")]
    Cancelled,

    /// Invalid memory ID format
    #[error("Invalid id: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for nimbus operations
pub type Result<T> = std::result::Result<T, NimbusError>;

/// Convert anyhow::Error to NimbusError
impl From<anyhow::Error> for NimbusError {
    fn from(err: anyhow::Error) -> Self {
        NimbusError::Other(err.to_string())
    }
}
