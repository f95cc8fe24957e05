//! Forwarding identity attributes to the upstream as headers or query
//! parameters, optionally encrypted and compressed.
//!
//! Wire format of an encrypted value: `base64(nonce[12] || ciphertext || tag[16])`,
//! AES-256-GCM keyed with SHA-256 of the configured secret. Filters run left
//! to right; a value still binary after the last filter is base64 encoded.

use crate::auth::Identity;
use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use axum::http::{HeaderName, HeaderValue};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    Encrypt,
    Zip,
    Base64,
}

/// One identity attribute to forward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingField {
    /// `.` for the whole identity, `email`, `username`, `provider`, or a
    /// dotted path into the attributes (optionally prefixed with `extra.`).
    pub path: String,
    pub query: Option<String>,
    pub header: Option<String>,
    pub filters: Vec<Filter>,
}

impl ForwardingField {
    pub fn header(path: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            header: Some(header.into()),
            ..Self::default()
        }
    }

    pub fn query(path: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Some(param.into()),
            ..Self::default()
        }
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }
}

/// AES-256-GCM over forwarded values.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let key = Sha256::digest(secret.as_ref());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("decryption failed".to_string()))
    }

    /// Encrypt and base64 encode.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        Ok(STANDARD.encode(self.seal(plaintext)?))
    }

    /// Reverse of [`FieldCipher::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let sealed = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Crypto(format!("invalid base64: {}", e)))?;
        self.open(&sealed)
    }
}

/// A value moving through a filter chain.
#[derive(Debug, Clone, PartialEq)]
enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) => b,
        }
    }

    fn into_text(self) -> String {
        match self {
            Payload::Text(s) => s,
            Payload::Bytes(b) => STANDARD.encode(b),
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Internal(format!("gzip failed: {}", e)))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Text of the identity field at `path`, or `None` when absent, empty or
/// not a scalar.
pub fn resolve(identity: &Identity, path: &str) -> Option<String> {
    let top = |s: &str| (!s.is_empty()).then(|| s.to_string());
    match path {
        "." => serde_json::to_string(identity).ok(),
        "email" => top(&identity.email),
        "username" => top(&identity.username),
        "provider" => top(&identity.provider),
        _ => {
            let dotted = path.strip_prefix("extra.").unwrap_or(path);
            let mut segments = dotted.split('.');
            let first = segments.next()?;
            let mut current = identity.attributes.get(first)?;
            for segment in segments {
                current = current.get(segment)?;
            }
            scalar_text(current)
        }
    }
}

/// Headers and query parameters produced for one identity.
#[derive(Debug, Clone, Default)]
pub struct Forwarded {
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub query: Vec<(String, String)>,
}

/// Append `query` to `url`, keeping any query it already has. A fragment
/// stays at the end.
pub fn append_query(url: &str, query: &[(String, String)]) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    let encoded = serde_urlencoded::to_string(query).unwrap_or_default();
    if encoded.is_empty() {
        return url.to_string();
    }
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    match fragment {
        Some(fragment) => format!("{}{}{}#{}", base, separator, encoded, fragment),
        None => format!("{}{}{}", base, separator, encoded),
    }
}

/// Applies the configured fields to identities.
#[derive(Clone, Default)]
pub struct Forwarder {
    fields: Vec<ForwardingField>,
    cipher: Option<FieldCipher>,
}

impl Forwarder {
    pub fn new(fields: Vec<ForwardingField>, encryption_key: Option<&str>) -> Self {
        Self {
            fields,
            cipher: encryption_key.filter(|k| !k.is_empty()).map(FieldCipher::new),
        }
    }

    pub fn fields(&self) -> &[ForwardingField] {
        &self.fields
    }

    /// Header names this forwarder may set. Client-supplied copies are
    /// stripped before forwarding.
    pub fn header_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|f| f.header.as_deref())
    }

    fn run_filters(&self, value: String, filters: &[Filter]) -> Result<String> {
        let mut payload = Payload::Text(value);
        for filter in filters {
            payload = match filter {
                Filter::Encrypt => {
                    let cipher = self.cipher.as_ref().ok_or_else(|| {
                        Error::Crypto("encrypt filter used without an encryption key".to_string())
                    })?;
                    Payload::Text(cipher.encrypt(payload.as_bytes())?)
                }
                Filter::Zip => Payload::Bytes(gzip(payload.as_bytes())?),
                Filter::Base64 => Payload::Text(STANDARD.encode(payload.as_bytes())),
            };
        }
        Ok(payload.into_text())
    }

    /// Value of one field for `identity`, `None` when it is skipped.
    pub fn render(&self, field: &ForwardingField, identity: &Identity) -> Option<String> {
        let Some(value) = resolve(identity, &field.path) else {
            tracing::debug!(path = %field.path, "forwarding field absent, skipped");
            return None;
        };
        match self.run_filters(value, &field.filters) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %field.path, "forwarding field skipped: {}", e);
                None
            }
        }
    }

    pub fn apply(&self, identity: &Identity) -> Forwarded {
        let mut out = Forwarded::default();
        for field in &self.fields {
            if field.header.is_none() && field.query.is_none() {
                continue;
            }
            let Some(value) = self.render(field, identity) else {
                continue;
            };
            if let Some(header) = &field.header {
                match (
                    HeaderName::try_from(header.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    (Ok(name), Ok(val)) => out.headers.push((name, val)),
                    _ => tracing::warn!(header = %header, "forwarding header not representable"),
                }
            }
            if let Some(query) = &field.query {
                out.query.push((query.clone(), value));
            }
        }
        out
    }
}
