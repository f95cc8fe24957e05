//! Passwordless email sign-in.
//!
//! Issuing a token stores two entries in the token store with the same TTL:
//! the token record under its value, and `otp:<code>` pointing at that
//! value. Either credential resolves to the same record, and consuming
//! either marks the record used so the other can no longer be redeemed.
//!
//! Issuance is limited per recipient over a rolling one-minute window.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

pub const OTP_LENGTH: usize = 12;
const OTP_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const OTP_INDEX_PREFIX: &str = "otp:";
const RATE_WINDOW_MS: i64 = 60_000;
const MAX_SWAP_ATTEMPTS: usize = 16;

/// Settings for the email method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSettings {
    pub enabled: bool,
    /// Token and OTP lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Tokens issued per recipient per minute.
    pub rate_limit_per_minute: usize,
    pub subject: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            token_ttl_secs: 15 * 60,
            rate_limit_per_minute: 5,
            subject: "Your sign-in link".to_string(),
        }
    }
}

/// A stored email token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailToken {
    pub value: String,
    pub email: String,
    pub otp: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// The message handed to an [`EmailSender`].
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to_email: String,
    pub subject: String,
    pub magic_link: String,
    pub otp: String,
    pub expires_at: DateTime<Utc>,
}

impl EmailMessage {
    pub fn body(&self) -> String {
        format!(
            "Sign in by opening this link:\n\n{}\n\nOr enter this code: {}\n\nBoth expire at {}.\n",
            self.magic_link,
            format_otp(&self.otp),
            self.expires_at.format("%H:%M UTC")
        )
    }
}

/// Email delivery.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Development sender that logs the message instead of delivering it.
#[derive(Clone, Debug, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        tracing::info!(
            to_email = %message.to_email,
            link = %message.magic_link,
            otp = %message.otp,
            "email send stub"
        );
        Ok(())
    }
}

/// Uniformly random code over `A-Z0-9`.
pub fn generate_otp() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..OTP_LENGTH)
        .map(|_| OTP_ALPHABET[rng.gen_range(0..OTP_ALPHABET.len())] as char)
        .collect()
}

/// Strip everything but ASCII letters and digits and uppercase the rest.
/// `None` unless exactly [`OTP_LENGTH`] characters remain.
pub fn normalize_otp(input: &str) -> Option<String> {
    let otp: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (otp.len() == OTP_LENGTH).then_some(otp)
}

/// `ABCD-EFGH-IJKL`, for display.
pub fn format_otp(otp: &str) -> String {
    otp.as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

fn otp_key(otp: &str) -> String {
    format!("{}{}", OTP_INDEX_PREFIX, otp)
}

fn remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires_at - now)
        .to_std()
        .unwrap_or_default()
        .max(Duration::from_secs(1))
}

/// Issues and redeems email tokens.
#[derive(Clone)]
pub struct EmailAuth {
    tokens: Arc<dyn KeyValueStore>,
    ratelimit: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    secret: Vec<u8>,
    ttl: chrono::Duration,
    limit: usize,
}

impl EmailAuth {
    pub fn new(
        tokens: Arc<dyn KeyValueStore>,
        ratelimit: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        secret: impl AsRef<[u8]>,
        settings: &EmailSettings,
    ) -> Self {
        Self {
            tokens,
            ratelimit,
            clock,
            secret: secret.as_ref().to_vec(),
            ttl: chrono::Duration::seconds(settings.token_ttl_secs as i64),
            limit: settings.rate_limit_per_minute,
        }
    }

    fn token_value(&self, email: &str) -> Result<String> {
        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        mac.update(email.as_bytes());
        mac.update(&salt);
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Record an issuance for `email`, failing with `RateLimited` when the
    /// last minute already holds the limit.
    ///
    /// The record is replaced with a compare-and-swap against what was read,
    /// so concurrent issuances for one recipient cannot both take the last slot.
    pub async fn check_rate_limit(&self, email: &str) -> Result<()> {
        let key = email.trim().to_lowercase();

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let now = self.clock.now().timestamp_millis();
            let current = self.ratelimit.get(&key).await?;
            let mut recent: Vec<i64> = current
                .as_deref()
                .and_then(|data| serde_json::from_slice(data).ok())
                .unwrap_or_default();
            recent.retain(|t| now - t < RATE_WINDOW_MS);
            if recent.len() >= self.limit {
                tracing::info!(email = %key, "email rate limit reached");
                return Err(Error::RateLimited);
            }

            recent.push(now);
            let data = serde_json::to_vec(&recent)?;
            let window = Duration::from_millis(RATE_WINDOW_MS as u64);
            if self
                .ratelimit
                .compare_and_swap(&key, current.as_deref(), &data, window)
                .await?
            {
                return Ok(());
            }
        }
        Err(Error::Storage(format!(
            "rate limit record for {} kept changing",
            key
        )))
    }

    /// Create and store a token and OTP for `email`.
    pub async fn issue(&self, email: &str) -> Result<EmailToken> {
        self.check_rate_limit(email).await?;

        let now = self.clock.now();
        let mut otp = generate_otp();
        // collisions are astronomically rare but would hijack another index entry
        while self.tokens.exists(&otp_key(&otp)).await? {
            otp = generate_otp();
        }

        let token = EmailToken {
            value: self.token_value(email)?,
            email: email.trim().to_string(),
            otp,
            created_at: now,
            expires_at: now + self.ttl,
            used: false,
        };
        let ttl = remaining(token.expires_at, now);

        self.tokens
            .set(&token.value, &serde_json::to_vec(&token)?, ttl)
            .await?;
        if let Err(e) = self
            .tokens
            .set(&otp_key(&token.otp), token.value.as_bytes(), ttl)
            .await
        {
            if let Err(cleanup) = self.tokens.delete(&token.value).await {
                tracing::warn!("could not roll back email token: {}", cleanup);
            }
            return Err(e);
        }

        tracing::info!(email = %token.email, "issued email token");
        Ok(token)
    }

    /// Redeem a magic-link token. Returns the email it was issued to.
    ///
    /// The record is flipped to used only if it is still the unused record
    /// that was read, so of two concurrent redemptions exactly one succeeds.
    pub async fn verify_token(&self, value: &str) -> Result<String> {
        let data = self.tokens.get(value).await?.ok_or(Error::TokenNotFound)?;
        let mut token: EmailToken =
            serde_json::from_slice(&data).map_err(|_| Error::InvalidToken)?;

        if token.used {
            return Err(Error::TokenAlreadyUsed);
        }
        let now = self.clock.now();
        if now >= token.expires_at {
            return Err(Error::TokenExpired);
        }

        token.used = true;
        let consumed = self
            .tokens
            .compare_and_swap(
                value,
                Some(data.as_slice()),
                &serde_json::to_vec(&token)?,
                remaining(token.expires_at, now),
            )
            .await?;
        if !consumed {
            tracing::info!(email = %token.email, "email token lost a concurrent redemption");
            return Err(Error::TokenAlreadyUsed);
        }
        tracing::info!(email = %token.email, "email token redeemed");
        Ok(token.email)
    }

    /// Redeem a one-time code. Formatting in `input` is ignored.
    pub async fn verify_otp(&self, input: &str) -> Result<String> {
        let otp = normalize_otp(input).ok_or(Error::TokenNotFound)?;
        let value = self
            .tokens
            .get(&otp_key(&otp))
            .await?
            .ok_or(Error::TokenNotFound)?;
        let value = String::from_utf8(value).map_err(|_| Error::InvalidToken)?;
        self.verify_token(&value).await
    }

    /// Delete a token and its OTP index.
    pub async fn revoke(&self, value: &str) -> Result<()> {
        if let Some(data) = self.tokens.get(value).await? {
            if let Ok(token) = serde_json::from_slice::<EmailToken>(&data) {
                self.tokens.delete(&otp_key(&token.otp)).await?;
            }
        }
        self.tokens.delete(value).await
    }
}
