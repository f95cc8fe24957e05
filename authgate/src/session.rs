use crate::auth::Identity;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Session identifier: 32 random bytes, hex encoded.
pub type SessionId = String;

/// An authenticated browser session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub email: String,
    pub display_name: String,
    pub provider: String,
    /// Provider fields plus `_email`, `_username` and `_avatar_url`.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub authenticated: bool,
}

impl Session {
    /// A fresh authenticated session for `identity`, valid for `lifetime`.
    pub fn issue(identity: &Identity, lifetime: chrono::Duration, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_session_id(),
            email: identity.email.clone(),
            display_name: identity.username.clone(),
            provider: identity.provider.clone(),
            attributes: identity.attributes.clone(),
            created_at: now,
            expires_at: now + lifetime,
            authenticated: true,
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.authenticated && now < self.expires_at
    }

    pub fn identity(&self) -> Identity {
        Identity {
            email: self.email.clone(),
            username: self.display_name.clone(),
            provider: self.provider.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

pub fn generate_session_id() -> SessionId {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Persists sessions in the session store.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Store a session until its expiry. Readable as soon as this returns.
    pub async fn create(&self, session: &Session) -> Result<()> {
        let remaining = (session.expires_at - self.clock.now())
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_secs(1));
        let data = serde_json::to_vec(session)?;
        self.store.set(&session.id, &data, remaining).await?;
        tracing::debug!(provider = %session.provider, "session created");
        Ok(())
    }

    /// Look up a session. Validity is left to the caller.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let Some(data) = self.store.get(id).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&data) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!("discarding unreadable session: {}", e);
                self.store.delete(id).await?;
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(id).await
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
