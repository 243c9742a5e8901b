use keyring::Entry;
use thiserror::Error;
use tracing::debug;

const SERVICE_NAME: &str = "dev.projmirror";
const SESSION_KEY: &str = "session_key";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("session key not found")]
    NotFound,
    #[error("session key is provided by PROJMIRROR_SESSION_KEY and cannot be changed here")]
    Overridden,
}

/// Holds the remote session key, either in the OS keyring or from an
/// environment override.
pub struct CredentialStorage {
    backend: Backend,
}

enum Backend {
    Env(String),
    Keyring(Entry),
}

impl CredentialStorage {
    /// Uses `override_key` when set, otherwise the OS keyring.
    pub fn new(override_key: Option<String>) -> Result<Self, CredentialError> {
        let backend = match override_key {
            Some(key) => {
                debug!("using session key from environment");
                Backend::Env(key)
            }
            None => Backend::Keyring(Entry::new(SERVICE_NAME, SESSION_KEY)?),
        };
        Ok(Self { backend })
    }

    pub fn session_key(&self) -> Result<String, CredentialError> {
        match &self.backend {
            Backend::Env(key) => Ok(key.clone()),
            Backend::Keyring(entry) => match entry.get_password() {
                Ok(key) => Ok(key),
                Err(keyring::Error::NoEntry) => Err(CredentialError::NotFound),
                Err(err) => Err(CredentialError::Keyring(err)),
            },
        }
    }

    pub fn save_session_key(&self, key: &str) -> Result<(), CredentialError> {
        match &self.backend {
            Backend::Env(_) => Err(CredentialError::Overridden),
            Backend::Keyring(entry) => {
                entry.set_password(key)?;
                Ok(())
            }
        }
    }

    pub fn delete_session_key(&self) -> Result<(), CredentialError> {
        match &self.backend {
            Backend::Env(_) => Err(CredentialError::Overridden),
            Backend::Keyring(entry) => match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(err) => Err(CredentialError::Keyring(err)),
            },
        }
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key().is_ok()
    }
}
