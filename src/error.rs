//! Mindstack error types

use thiserror::Error;

/// Mindstack error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record or layer storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding backend error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Generation backend error
    #[error("Generation error: {0}")]
    Generation(String),

    /// A derived snapshot failed its referential closure check.
    /// The run must be retried; nothing was persisted.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Another writer committed a newer generation first
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Mindstack operations
pub type Result<T> = std::result::Result<T, Error>;
