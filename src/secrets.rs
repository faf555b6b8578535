use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

const KEY_LENGTH: usize = 64;

/// Holds the database encryption key in the OS keychain. The in-memory
/// backend exists for tests and ephemeral sessions, where no keychain entry
/// should ever be written.
#[derive(Clone)]
pub struct KeyVault {
    service_name: String,
    backend: VaultBackend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLifecycle {
    Retrieved,
    Created,
    Rotated,
}

impl KeyLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyLifecycle::Retrieved => "retrieved",
            KeyLifecycle::Created => "created",
            KeyLifecycle::Rotated => "rotated",
        }
    }
}

pub struct KeyMaterial {
    secret: SecretString,
    lifecycle: KeyLifecycle,
}

impl KeyMaterial {
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn lifecycle(&self) -> KeyLifecycle {
        self.lifecycle
    }
}

#[derive(Clone)]
enum VaultBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl KeyVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: VaultBackend::Keyring,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: VaultBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Returns the stored key, creating one on first use.
    pub fn ensure(&self, account: &str) -> AppResult<KeyMaterial> {
        if let Some(secret) = self.try_get(account)? {
            debug!(
                target: "secret_vault",
                service = %self.service_name,
                account,
                "loaded key from secure backend"
            );
            return Ok(KeyMaterial {
                secret,
                lifecycle: KeyLifecycle::Retrieved,
            });
        }
        let secret = generate_key();
        self.store(account, &secret)?;
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "created new key in secure backend"
        );
        Ok(KeyMaterial {
            secret,
            lifecycle: KeyLifecycle::Created,
        })
    }

    /// Replaces the stored key unconditionally. Data encrypted under the old
    /// key becomes unreadable.
    pub fn rotate(&self, account: &str) -> AppResult<KeyMaterial> {
        let secret = generate_key();
        self.store(account, &secret)?;
        warn!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "rotated key material"
        );
        Ok(KeyMaterial {
            secret,
            lifecycle: KeyLifecycle::Rotated,
        })
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            VaultBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            VaultBackend::Memory(store) => {
                store.lock().remove(account);
                Ok(())
            }
        }
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.try_get(account).map(|secret| secret.is_some())
    }

    fn try_get(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            VaultBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::new(value.into()))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            VaultBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    fn store(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            VaultBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
                Ok(())
            }
            VaultBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
                Ok(())
            }
        }
    }
}

fn generate_key() -> SecretString {
    let mut bytes = vec![0_u8; KEY_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    SecretString::new(STANDARD_NO_PAD.encode(bytes).into())
}
