//! Credential lookup for API keys.
//!
//! Keys for the completion provider and the telemetry exporter are read from
//! the system keyring, with environment variables as a fallback for CI and
//! deployments.
//!
//! # Example
//!
//! ```ignore
//! use sia_models::auth::CredentialStore;
//!
//! let store = CredentialStore::new("sia").with_env_fallback();
//!
//! // Keyring first, then OPENAI_API_KEY
//! let key = store.get("openai")?;
//! ```

use std::env;

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::{Error, Result};

/// A secure API key that prevents accidental logging.
///
/// Backed by `SecretString`: `Debug` is redacted, memory is zeroized on drop,
/// and the value is only reachable through [`ApiKey::expose_secret`].
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Create a new API key from a string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    /// Expose the secret key value.
    ///
    /// Use sparingly - only when actually sending to an API.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Environment variable names for each credential owner.
const ENV_VARS: &[(&str, &str)] = &[
    ("openai", "OPENAI_API_KEY"),
    ("arize", "ARIZE_DEVELOPER_KEY"),
];

/// Get the environment variable name for a provider.
fn env_var_for_provider(provider: &str) -> Option<&'static str> {
    ENV_VARS
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, v)| *v)
}

/// Credential storage with system keyring and environment fallback.
///
/// Lookup order:
/// 1. System keyring (if available)
/// 2. Environment variables (if `env_fallback` is enabled)
pub struct CredentialStore {
    service_name: String,
    env_fallback: bool,
}

impl CredentialStore {
    /// Create a new credential store for a keyring service (e.g., "sia").
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            env_fallback: false,
        }
    }

    /// Enable environment variable fallback.
    pub fn with_env_fallback(mut self) -> Self {
        self.env_fallback = true;
        self
    }

    /// Get an API key for a provider.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialsNotFound` if no credentials are found.
    pub fn get(&self, provider: &str) -> Result<ApiKey> {
        self.get_with_env(provider, |var| env::var(var).ok())
    }

    fn get_with_env(
        &self,
        provider: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ApiKey> {
        if let Some(key) = self.get_from_keyring(provider) {
            debug!(provider, "retrieved API key from keyring");
            return Ok(key);
        }

        if self.env_fallback
            && let Some(key) = env_var_for_provider(provider)
                .and_then(&env)
                .filter(|v| !v.is_empty())
                .map(ApiKey::new)
        {
            debug!(provider, "retrieved API key from environment");
            return Ok(key);
        }

        Err(Error::CredentialsNotFound(provider.to_string()))
    }

    fn keyring_entry(&self, provider: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service_name, provider).map_err(|e| Error::Keyring(e.to_string()))
    }

    fn get_from_keyring(&self, provider: &str) -> Option<ApiKey> {
        let entry = self.keyring_entry(provider).ok()?;
        entry.get_password().ok().map(ApiKey::new)
    }
}
