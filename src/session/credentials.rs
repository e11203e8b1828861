//! Credentials the engine asks for over the management channel
//!
//! Kinds are the engine's names: `Auth` (username and password),
//! `Private Key` (key passphrase) and `HTTP Proxy`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

pub const KIND_AUTH: &str = "Auth";
pub const KIND_PRIVATE_KEY: &str = "Private Key";

const KEYRING_SERVICE: &str = "ovpnctl";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("No signing key available")]
    NoSigningKey,
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

pub trait CredentialProvider: Send + Sync {
    /// Username to send with an `Auth` password
    fn username(&self) -> Option<String>;
    fn password(&self, kind: &str) -> Option<String>;
    /// Sign base64 data for `RSA_SIGN`, returning base64
    fn sign(&self, _data: &str) -> Result<String, CredentialError> {
        Err(CredentialError::NoSigningKey)
    }
}

/// Credentials held for the lifetime of one session
#[derive(Default)]
pub struct MemoryCredentials {
    username: Mutex<Option<String>>,
    passwords: Mutex<HashMap<String, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_username(&self, username: &str) {
        *self.username.lock().unwrap_or_else(PoisonError::into_inner) = Some(username.to_string());
    }

    pub fn set_password(&self, kind: &str, password: &str) {
        self.passwords
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_string(), password.to_string());
    }

    /// Forget a password the engine rejected
    pub fn forget(&self, kind: &str) {
        self.passwords
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind);
    }
}

impl CredentialProvider for MemoryCredentials {
    fn username(&self) -> Option<String> {
        self.username
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn password(&self, kind: &str) -> Option<String> {
        self.passwords
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }
}

/// Passwords stored in the OS keyring, keyed by profile and kind
pub struct KeyringStore {
    profile: String,
}

impl KeyringStore {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
        }
    }

    fn entry(&self, kind: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(KEYRING_SERVICE, &format!("{}/{}", self.profile, kind))
    }

    pub fn get(&self, kind: &str) -> Option<String> {
        match self.entry(kind).and_then(|e| e.get_password()) {
            Ok(password) => Some(password),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                debug!("Keyring lookup for '{}' failed: {}", kind, e);
                None
            }
        }
    }

    pub fn store(&self, kind: &str, password: &str) -> Result<(), CredentialError> {
        self.entry(kind)?.set_password(password)?;
        Ok(())
    }

    pub fn delete(&self, kind: &str) -> Result<(), CredentialError> {
        match self.entry(kind)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Session credentials first, then the keyring
pub struct LayeredCredentials {
    session: MemoryCredentials,
    keyring: Option<KeyringStore>,
}

impl LayeredCredentials {
    pub fn new(session: MemoryCredentials, keyring: Option<KeyringStore>) -> Self {
        Self { session, keyring }
    }

    pub fn session(&self) -> &MemoryCredentials {
        &self.session
    }
}

impl CredentialProvider for LayeredCredentials {
    fn username(&self) -> Option<String> {
        self.session.username()
    }

    fn password(&self, kind: &str) -> Option<String> {
        if let Some(password) = self.session.password(kind) {
            return Some(password);
        }
        let password = self.keyring.as_ref()?.get(kind)?;
        if kind == KIND_PRIVATE_KEY {
            debug!("Using private key password from keyring");
        }
        // Keep it for reconnects without another keyring round trip
        self.session.set_password(kind, &password);
        Some(password)
    }

    fn sign(&self, data: &str) -> Result<String, CredentialError> {
        warn!("Signature requested for {} bytes but no external key is configured", data.len());
        Err(CredentialError::NoSigningKey)
    }
}
