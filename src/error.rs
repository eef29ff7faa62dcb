use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Object store error: {0}")]
    Storage(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Transcript cache error: {0}")]
    TranscriptCache(String),

    #[error("Summariser failed: {0}")]
    Summarizer(String),

    #[error("CRM sync failed: {0}")]
    Crm(String),

    #[error("Malformed event: {0}")]
    Schema(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Decryption failed: wrong key or corrupt data")]
    Decryption,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bus<S: Into<String>>(msg: S) -> Self {
        Self::Bus(msg.into())
    }

    pub fn schema<S: Into<String>>(msg: S) -> Self {
        Self::Schema(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry can reasonably succeed.
    ///
    /// Transient failures (bus publish, object-store upload, DB conflicts)
    /// are retried with backoff; everything else is logged and dropped or
    /// surfaced to the operator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Bus(_) | Self::Storage(_) | Self::Database(_) | Self::Http(_)
        )
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        Self::TranscriptCache(err.to_string())
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
