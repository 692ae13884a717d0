//! Error types for completion providers and credentials.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a completion provider.
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials not found for provider.
    #[error("credentials not found for provider: {0}")]
    CredentialsNotFound(String),

    /// Failed to access system keyring.
    #[error("keyring error: {0}")]
    Keyring(String),

    /// Provider API error.
    #[error("provider API error: {0}")]
    ProviderApi(String),

    /// Request failed.
    #[error("request failed: {0}")]
    Request(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
