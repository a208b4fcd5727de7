//! Error types for Kindling

use thiserror::Error;

/// Main error type for Kindling
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Timeouts, rate limits and dropped connections. Retried by the job queue.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Expired or revoked OAuth grant, or rejected static credentials.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Terminal provider rejection, e.g. an invalid recipient.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The sender reached its daily cap while the job was running.
    #[error("Daily quota exhausted for account {0}")]
    QuotaDeferred(uuid::Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Kindling
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Transient(_) => 503,
            Error::Auth(_) => 401,
            Error::Transport(_) => 502,
            Error::QuotaDeferred(_) => 429,
            Error::Validation(_) => 422,
            Error::NotFound(_) => 404,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Transient(_) => "PROVIDER_UNAVAILABLE",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::Transport(_) => "PROVIDER_REJECTED",
            Error::QuotaDeferred(_) => "QUOTA_DEFERRED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the job queue should retry this failure with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Database(_) | Error::Internal(_) | Error::Other(_)
        )
    }

    /// Shorthand for a missing row of the given kind
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{} {}", kind, id))
    }
}
