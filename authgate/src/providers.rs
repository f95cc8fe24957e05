//! Identity provider adapters and the registry the gateway looks them up in.

use crate::auth::Identity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const CLIENT_USER_AGENT: &str = concat!("authgate/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Github,
    Microsoft,
    /// Any OpenID Connect compatible provider with explicit endpoints.
    #[default]
    #[serde(alias = "custom")]
    Oidc,
}

/// Configuration of one identity provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Name used in URLs (`/oauth2/start/{name}`) and recorded on sessions.
    pub name: String,
    pub kind: ProviderKind,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
    /// Extra scopes, or the full scope list when `reset_scopes` is set.
    pub scopes: Vec<String>,
    pub reset_scopes: bool,
    /// Accept invalid TLS certificates. Only honored for OIDC providers.
    pub insecure_skip_verify: bool,
    /// Label on the login page.
    pub display_name: Option<String>,
    /// Microsoft tenant, `common` when unset.
    pub tenant: Option<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn with_client(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.client_id = id.into();
        self.client_secret = secret.into();
        self
    }

    pub fn with_endpoints(
        mut self,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
        userinfo_url: impl Into<String>,
    ) -> Self {
        self.auth_url = Some(auth_url.into());
        self.token_url = Some(token_url.into());
        self.userinfo_url = Some(userinfo_url.into());
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>, reset: bool) -> Self {
        self.scopes = scopes;
        self.reset_scopes = reset;
        self
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Scopes to request given a provider's defaults and the configured list.
///
/// With `reset`, a non-empty configured list replaces the defaults and an
/// empty one falls back to them. Otherwise configured scopes are appended
/// to the defaults, skipping duplicates.
pub fn resolve_scopes(defaults: &[&str], custom: &[String], reset: bool) -> Vec<String> {
    if reset {
        if custom.is_empty() {
            return defaults.iter().map(|s| s.to_string()).collect();
        }
        return custom.to_vec();
    }
    let mut scopes: Vec<String> = defaults.iter().map(|s| s.to_string()).collect();
    for scope in custom {
        if !scopes.contains(scope) {
            scopes.push(scope.clone());
        }
    }
    scopes
}

/// What a provider told us about the user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    /// May be empty when the provider does not share one.
    pub email: String,
    pub name: String,
    pub username: String,
    pub avatar_url: Option<String>,
    /// The provider's response as returned.
    pub raw: Map<String, Value>,
}

impl UserInfo {
    /// `name`, then `username`, then `email`.
    pub fn display_name(&self) -> &str {
        [&self.name, &self.username, &self.email]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn into_identity(self, provider: &str) -> Identity {
        let username = self.display_name().to_string();
        let avatar = self.avatar_url.clone();
        let mut identity = Identity::new(provider, self.email).with_username(username);
        identity.attributes = self.raw;
        identity.with_standard_attributes(avatar.as_deref())
    }
}

fn str_field(raw: &Map<String, Value>, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Display name from OIDC claims: `name`, then `preferred_username`, then
/// `given_name` and `family_name` joined.
pub fn oidc_display_name(raw: &Map<String, Value>) -> Option<String> {
    str_field(raw, "name")
        .or_else(|| str_field(raw, "preferred_username"))
        .or_else(|| {
            let given = str_field(raw, "given_name").unwrap_or_default();
            let family = str_field(raw, "family_name").unwrap_or_default();
            let joined = format!("{} {}", given, family).trim().to_string();
            (!joined.is_empty()).then_some(joined)
        })
}

/// GET a JSON document with the access token as bearer credentials.
async fn fetch_json(http: &reqwest::Client, url: &str, access_token: &str) -> Result<Value> {
    let response = http
        .get(url)
        .bearer_auth(access_token)
        .header(ACCEPT, "application/json")
        .header(USER_AGENT, CLIENT_USER_AGENT)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Provider(format!(
            "user info request to {} returned {}: {}",
            url, status, body
        )));
    }
    Ok(response.json().await?)
}

async fn fetch_object(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<Map<String, Value>> {
    match fetch_json(http, url, access_token).await? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Provider(format!(
            "user info from {} is not an object: {}",
            url, other
        ))),
    }
}

/// An OAuth2 identity provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn config(&self) -> &ProviderConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn authorize_url(&self) -> &str;

    fn token_url(&self) -> &str;

    /// Scopes requested when none are configured.
    fn default_scopes(&self) -> &'static [&'static str];

    fn scopes(&self) -> Vec<String> {
        let config = self.config();
        resolve_scopes(self.default_scopes(), &config.scopes, config.reset_scopes)
    }

    /// Provider-specific parameters added to the authorization URL.
    fn authorize_params(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    /// Client to use instead of the shared one.
    fn http_client(&self) -> Option<&reqwest::Client> {
        None
    }

    async fn user_info(&self, http: &reqwest::Client, access_token: &str) -> Result<UserInfo>;
}

pub struct GoogleProvider {
    config: ProviderConfig,
}

impl GoogleProvider {
    pub const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    pub const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    pub const USERINFO_URL: &'static str = "https://openidconnect.googleapis.com/v1/userinfo";

    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn authorize_url(&self) -> &str {
        self.config.auth_url.as_deref().unwrap_or(Self::AUTH_URL)
    }

    fn token_url(&self) -> &str {
        self.config.token_url.as_deref().unwrap_or(Self::TOKEN_URL)
    }

    fn default_scopes(&self) -> &'static [&'static str] {
        &["openid", "email", "profile"]
    }

    fn authorize_params(&self) -> &'static [(&'static str, &'static str)] {
        &[("access_type", "online"), ("prompt", "select_account")]
    }

    async fn user_info(&self, http: &reqwest::Client, access_token: &str) -> Result<UserInfo> {
        let url = self.config.userinfo_url.as_deref().unwrap_or(Self::USERINFO_URL);
        let raw = fetch_object(http, url, access_token).await?;
        Ok(UserInfo {
            email: str_field(&raw, "email").unwrap_or_default(),
            name: str_field(&raw, "name").unwrap_or_default(),
            username: String::new(),
            avatar_url: str_field(&raw, "picture"),
            raw,
        })
    }
}

pub struct GitHubProvider {
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    verified: bool,
}

impl GitHubProvider {
    pub const AUTH_URL: &'static str = "https://github.com/login/oauth/authorize";
    pub const TOKEN_URL: &'static str = "https://github.com/login/oauth/access_token";
    pub const USERINFO_URL: &'static str = "https://api.github.com/user";

    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn userinfo_url(&self) -> &str {
        self.config.userinfo_url.as_deref().unwrap_or(Self::USERINFO_URL)
    }

    /// Primary verified address from `/user/emails`. Empty on any failure.
    async fn primary_email(&self, http: &reqwest::Client, access_token: &str) -> String {
        let url = format!("{}/emails", self.userinfo_url().trim_end_matches('/'));
        let emails = match fetch_json(http, &url, access_token).await {
            Ok(value) => serde_json::from_value::<Vec<GitHubEmail>>(value),
            Err(e) => {
                tracing::warn!("github email lookup failed: {}", e);
                return String::new();
            }
        };
        match emails {
            Ok(emails) => emails
                .iter()
                .find(|e| e.primary && e.verified)
                .or_else(|| emails.iter().find(|e| e.verified))
                .map(|e| e.email.clone())
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!("github email list unreadable: {}", e);
                String::new()
            }
        }
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn authorize_url(&self) -> &str {
        self.config.auth_url.as_deref().unwrap_or(Self::AUTH_URL)
    }

    fn token_url(&self) -> &str {
        self.config.token_url.as_deref().unwrap_or(Self::TOKEN_URL)
    }

    fn default_scopes(&self) -> &'static [&'static str] {
        &["read:user", "user:email"]
    }

    async fn user_info(&self, http: &reqwest::Client, access_token: &str) -> Result<UserInfo> {
        let raw = fetch_object(http, self.userinfo_url(), access_token).await?;
        let email = match str_field(&raw, "email") {
            Some(email) => email,
            None => self.primary_email(http, access_token).await,
        };
        Ok(UserInfo {
            email,
            name: str_field(&raw, "name").unwrap_or_default(),
            username: str_field(&raw, "login").unwrap_or_default(),
            avatar_url: str_field(&raw, "avatar_url"),
            raw,
        })
    }
}

pub struct MicrosoftProvider {
    config: ProviderConfig,
    auth_url: String,
    token_url: String,
}

impl MicrosoftProvider {
    pub const USERINFO_URL: &'static str = "https://graph.microsoft.com/v1.0/me";

    pub fn new(config: ProviderConfig) -> Self {
        let tenant = config.tenant.clone().unwrap_or_else(|| "common".to_string());
        let base = format!("https://login.microsoftonline.com/{}/oauth2/v2.0", tenant);
        let auth_url = config
            .auth_url
            .clone()
            .unwrap_or_else(|| format!("{}/authorize", base));
        let token_url = config
            .token_url
            .clone()
            .unwrap_or_else(|| format!("{}/token", base));
        Self {
            config,
            auth_url,
            token_url,
        }
    }
}

#[async_trait]
impl Provider for MicrosoftProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn authorize_url(&self) -> &str {
        &self.auth_url
    }

    fn token_url(&self) -> &str {
        &self.token_url
    }

    fn default_scopes(&self) -> &'static [&'static str] {
        &["openid", "email", "profile", "User.Read"]
    }

    async fn user_info(&self, http: &reqwest::Client, access_token: &str) -> Result<UserInfo> {
        let url = self.config.userinfo_url.as_deref().unwrap_or(Self::USERINFO_URL);
        let raw = fetch_object(http, url, access_token).await?;
        let principal = str_field(&raw, "userPrincipalName").unwrap_or_default();
        Ok(UserInfo {
            email: str_field(&raw, "mail").unwrap_or_else(|| principal.clone()),
            name: str_field(&raw, "displayName").unwrap_or_default(),
            username: principal,
            avatar_url: None,
            raw,
        })
    }
}

/// Generic OpenID Connect provider with configured endpoints.
pub struct CustomProvider {
    config: ProviderConfig,
    auth_url: String,
    token_url: String,
    userinfo_url: String,
    http: Option<reqwest::Client>,
}

impl CustomProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let required = |value: &Option<String>, field: &str| {
            value.clone().filter(|v| !v.is_empty()).ok_or_else(|| {
                Error::Provider(format!("provider {} requires {}", config.name, field))
            })
        };
        let auth_url = required(&config.auth_url, "auth_url")?;
        let token_url = required(&config.token_url, "token_url")?;
        let userinfo_url = required(&config.userinfo_url, "userinfo_url")?;

        let http = if config.insecure_skip_verify {
            tracing::warn!(
                provider = %config.name,
                "TLS certificate verification disabled for provider"
            );
            Some(
                http_client_builder()
                    .danger_accept_invalid_certs(true)
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self {
            config,
            auth_url,
            token_url,
            userinfo_url,
            http,
        })
    }
}

#[async_trait]
impl Provider for CustomProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn authorize_url(&self) -> &str {
        &self.auth_url
    }

    fn token_url(&self) -> &str {
        &self.token_url
    }

    fn default_scopes(&self) -> &'static [&'static str] {
        &["openid", "email", "profile"]
    }

    fn http_client(&self) -> Option<&reqwest::Client> {
        self.http.as_ref()
    }

    async fn user_info(&self, http: &reqwest::Client, access_token: &str) -> Result<UserInfo> {
        let http = self.http.as_ref().unwrap_or(http);
        let raw = fetch_object(http, &self.userinfo_url, access_token).await?;
        Ok(UserInfo {
            email: str_field(&raw, "email").unwrap_or_default(),
            name: oidc_display_name(&raw).unwrap_or_default(),
            username: str_field(&raw, "preferred_username").unwrap_or_default(),
            avatar_url: str_field(&raw, "picture"),
            raw,
        })
    }
}

/// Client settings shared by every outbound provider call.
pub fn http_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .user_agent(CLIENT_USER_AGENT)
}

pub fn build_provider(config: ProviderConfig) -> Result<Arc<dyn Provider>> {
    Ok(match config.kind {
        ProviderKind::Google => Arc::new(GoogleProvider::new(config)),
        ProviderKind::Github => Arc::new(GitHubProvider::new(config)),
        ProviderKind::Microsoft => Arc::new(MicrosoftProvider::new(config)),
        ProviderKind::Oidc => Arc::new(CustomProvider::new(config)?),
    })
}

/// Providers by name, in registration order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(build_provider(config.clone())?);
        }
        Ok(registry)
    }

    /// Add a provider, replacing any with the same name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if self.providers.insert(name.clone(), provider).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.order.iter().filter_map(|name| self.providers.get(name))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
