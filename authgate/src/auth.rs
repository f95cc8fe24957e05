//! The authenticated identity and helpers for reading it downstream.
//!
//! After a request passes the gateway, the [`Identity`] of its session is
//! placed in the request extensions. Upstream services running in the same
//! process can take it with the [`AuthenticatedUser`] extractor; remote
//! upstreams receive it as headers (see [`crate::forward`]).

use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ATTR_EMAIL: &str = "_email";
pub const ATTR_USERNAME: &str = "_username";
pub const ATTR_AVATAR_URL: &str = "_avatar_url";

/// Normalized result of any authentication method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub username: String,
    pub provider: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Identity {
    pub fn new(provider: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            provider: provider.into(),
            ..Self::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Fill the standardized `_email`, `_username` and `_avatar_url`
    /// attributes from the top-level fields.
    pub fn with_standard_attributes(mut self, avatar_url: Option<&str>) -> Self {
        self.attributes
            .insert(ATTR_EMAIL.to_string(), Value::from(self.email.clone()));
        self.attributes
            .insert(ATTR_USERNAME.to_string(), Value::from(self.username.clone()));
        if let Some(avatar) = avatar_url.filter(|a| !a.is_empty()) {
            self.attributes
                .insert(ATTR_AVATAR_URL.to_string(), Value::from(avatar));
        }
        self
    }

    pub fn has_email(&self) -> bool {
        !self.email.is_empty()
    }
}

/// Extractor for the identity the gateway attached to the request.
///
/// # Example
///
/// ```rust,ignore
/// async fn profile(AuthenticatedUser(identity): AuthenticatedUser) -> String {
///     format!("Hello, {}!", identity.username)
/// }
/// ```
pub struct AuthenticatedUser(pub Identity);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(AuthenticatedUser)
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}
