//! Credential sources for samsync.
//!
//! API keys are never written into configuration or code. A config file
//! only names *where* a secret lives: an environment variable or an entry
//! in the OS keyring. Secrets are resolved once at startup.

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Keyring service name all samsync secrets are stored under.
pub const KEYRING_SERVICE: &str = "samsync";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("credential from {0} is empty")]
    Empty(String),

    #[error("keyring lookup for '{account}' failed: {source}")]
    Keyring {
        account: String,
        #[source]
        source: keyring::Error,
    },
}

/// Where a secret is read from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// Read from an environment variable.
    Env { var: String },

    /// Read from the OS keyring under [`KEYRING_SERVICE`].
    Keyring { account: String },
}

impl CredentialSource {
    pub fn env(var: &str) -> Self {
        CredentialSource::Env {
            var: var.to_string(),
        }
    }

    /// Human readable location, safe to log.
    pub fn describe(&self) -> String {
        match self {
            CredentialSource::Env { var } => format!("env:{}", var),
            CredentialSource::Keyring { account } => format!("keyring:{}/{}", KEYRING_SERVICE, account),
        }
    }

    /// Resolve the secret. Surrounding whitespace is trimmed.
    pub fn resolve(&self) -> Result<Secret, CredentialError> {
        let raw = match self {
            CredentialSource::Env { var } => {
                std::env::var(var).map_err(|_| CredentialError::MissingEnv(var.clone()))?
            }
            CredentialSource::Keyring { account } => keyring::Entry::new(KEYRING_SERVICE, account)
                .and_then(|entry| entry.get_password())
                .map_err(|source| {
                    warn!("keyring read failed for {}", account);
                    CredentialError::Keyring {
                        account: account.clone(),
                        source,
                    }
                })?,
        };

        let value = raw.trim().to_string();
        if value.is_empty() {
            return Err(CredentialError::Empty(self.describe()));
        }
        debug!("resolved credential from {} (length: {})", self.describe(), value.len());
        Ok(Secret(value))
    }
}

/// A resolved secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}
