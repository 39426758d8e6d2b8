// src/sys/secrets.rs

use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const SETUP_PASSWORD_LEN: usize = 16;

/// Credential is a redacting, zeroizing wrapper around a remote login secret:
/// the one-time root password a server is bootstrapped with, or the static
/// server's configured password.
///
/// `{:?}` prints `[REDACTED]`, and the backing buffer is zeroized on drop.
/// It is still persisted in the registry snapshot because bootstrap-phase
/// servers have no other access path.
pub struct Credential {
    secret: Secret<String>,
}

impl Credential {
    pub fn new(raw: String) -> Self {
        Self {
            secret: Secret::new(raw),
        }
    }

    /// Generates the one-time setup password embedded in a bootstrap payload.
    pub fn generate_setup_password() -> Self {
        let raw: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SETUP_PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self::new(raw)
    }

    /// Exposes the secret for the duration of `action` only.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.secret.expose_secret())
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self::new(self.secret.expose_secret().clone())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.secret.expose_secret() == other.secret.expose_secret()
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.secret.expose_secret())
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}
