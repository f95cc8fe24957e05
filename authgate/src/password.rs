//! Shared-password sign-in.

use crate::auth::Identity;
use crate::config::PasswordSettings;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Provider name recorded on password sessions.
pub const PROVIDER: &str = "password";

const ANONYMOUS_USERNAME: &str = "password user";

/// Checks submitted passwords against the configured one.
#[derive(Clone)]
pub struct PasswordAuth {
    digest: Vec<u8>,
}

impl std::fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuth").finish_non_exhaustive()
    }
}

impl PasswordAuth {
    pub fn new(password: &str) -> Self {
        Self {
            digest: Sha256::digest(password.as_bytes()).to_vec(),
        }
    }

    /// `None` when no password is configured.
    pub fn from_settings(settings: &PasswordSettings) -> Option<Self> {
        settings.password.as_deref().map(Self::new)
    }

    /// Compares digests in constant time, so neither the content nor the
    /// length of the secret leaks through timing.
    pub fn verify(&self, given: &str) -> Result<()> {
        let given = Sha256::digest(given.as_bytes());
        if bool::from(given.as_slice().ct_eq(&self.digest)) {
            Ok(())
        } else {
            tracing::info!("password sign-in rejected");
            Err(Error::Forbidden("wrong password".to_string()))
        }
    }

    /// Identity for a successful sign-in. `email` is whatever the form
    /// carried and may be empty.
    pub fn identity(&self, email: &str) -> Identity {
        let email = email.trim();
        let username = if email.is_empty() {
            ANONYMOUS_USERNAME
        } else {
            email
        };
        Identity::new(PROVIDER, email)
            .with_username(username)
            .with_standard_attributes(None)
    }
}
