//! Remembered vault password.
//!
//! The vault password can be kept in the platform keychain so it does not
//! have to be typed for every command. Only the plaintext password crosses
//! this boundary, never derived key material.

use std::sync::{Mutex, MutexGuard};

use zeroize::Zeroizing;

use crate::error::SecretStoreError;

pub const SERVICE: &str = "cardvault";
pub const ACCOUNT: &str = "vault-password";

pub trait SecretStore {
    /// The stored password, or `None` if nothing is stored.
    fn get(&self) -> Result<Option<Zeroizing<String>>, SecretStoreError>;

    fn set(&self, password: &str) -> Result<(), SecretStoreError>;

    /// Forgets the password. Deleting a missing entry succeeds.
    fn delete(&self) -> Result<(), SecretStoreError>;
}

/// OS keychain through the `keyring` crate.
pub struct KeyringStore {
    service: String,
    account: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_names(SERVICE, ACCOUNT)
    }

    pub fn with_names(service: &str, account: &str) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(&self.service, &self.account).map_err(unavailable)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(e: keyring::Error) -> SecretStoreError {
    SecretStoreError::Unavailable(e.to_string())
}

impl SecretStore for KeyringStore {
    fn get(&self) -> Result<Option<Zeroizing<String>>, SecretStoreError> {
        match self.entry()?.get_password() {
            Ok(pw) => Ok(Some(Zeroizing::new(pw))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn set(&self, password: &str) -> Result<(), SecretStoreError> {
        self.entry()?.set_password(password).map_err(unavailable)
    }

    fn delete(&self) -> Result<(), SecretStoreError> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }
}

/// Process-local store for tests and headless runs.
#[derive(Default)]
pub struct MemoryStore {
    password: Mutex<Option<Zeroizing<String>>>,
}

impl MemoryStore {
    fn slot(&self) -> Result<MutexGuard<'_, Option<Zeroizing<String>>>, SecretStoreError> {
        self.password
            .lock()
            .map_err(|_| SecretStoreError::Unavailable("memory store poisoned".into()))
    }
}

impl SecretStore for MemoryStore {
    fn get(&self) -> Result<Option<Zeroizing<String>>, SecretStoreError> {
        Ok(self.slot()?.clone())
    }

    fn set(&self, password: &str) -> Result<(), SecretStoreError> {
        *self.slot()? = Some(Zeroizing::new(password.to_string()));
        Ok(())
    }

    fn delete(&self) -> Result<(), SecretStoreError> {
        *self.slot()? = None;
        Ok(())
    }
}
