//! Coasters Error Types

use thiserror::Error;

/// Result type alias for coasters operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coasters error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    // Record errors
    #[error("Record serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid record id: {0:?}")]
    InvalidRecordId(String),

    // Wire errors
    #[error("Wire codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),

    // Coordination errors
    #[error("Lock service error: {0}")]
    LockService(String),

    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a transient infrastructure failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Unavailable(_)
                | Error::Network(_)
                | Error::LockService(_)
                | Error::Io(_)
        )
    }
}
