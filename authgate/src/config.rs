use crate::cookies::{CookieOptions, SameSite};
use crate::email::EmailSettings;
use crate::error::{Result, ValidationErrors};
use crate::forward::{Filter, ForwardingField};
use crate::providers::{ProviderConfig, ProviderKind};
use crate::rules::{RuleConfig, RuleSet};
use crate::store::StorageConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const MIN_SECRET_LEN: usize = 32;

/// Session cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub name: String,
    /// Signs every cookie the gateway sets. At least 32 bytes.
    pub secret: String,
    /// Session lifetime in seconds.
    pub max_age_secs: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    pub domain: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "authgate_session".to_string(),
            secret: String::new(),
            max_age_secs: 24 * 60 * 60,
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            domain: None,
        }
    }
}

impl CookieConfig {
    pub fn options(&self) -> CookieOptions {
        CookieOptions {
            path: "/".to_string(),
            domain: self.domain.clone(),
            max_age: Some(self.max_age_secs),
            secure: self.secure,
            http_only: self.http_only,
            same_site: self.same_site,
        }
    }
}

/// Static password method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordSettings {
    /// Disabled when unset.
    pub password: Option<String>,
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Path prefix of the gateway's own endpoints.
    pub prefix: String,
    /// Public origin, e.g. `https://app.example.com`. Derived from the
    /// request when unset.
    pub base_url: Option<String>,
    /// Honor `X-Forwarded-Host` and `X-Forwarded-Proto` when deriving the
    /// origin. Only for deployments behind a proxy that sets both.
    pub trust_forwarded_headers: bool,
    pub cookie: CookieConfig,
    pub providers: Vec<ProviderConfig>,
    /// Emails (or `@domain` suffixes) allowed to sign in. Empty allows anyone.
    pub allowed_emails: Vec<String>,
    pub rules: Vec<RuleConfig>,
    pub forwarding: Vec<ForwardingField>,
    /// Key for the `encrypt` forwarding filter.
    pub encryption_key: Option<String>,
    pub email: EmailSettings,
    pub password: PasswordSettings,
    pub storage: StorageConfig,
    /// Relaxes the content security policy for local development.
    pub dev_mode: bool,
    pub title: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prefix: "/_auth".to_string(),
            base_url: None,
            trust_forwarded_headers: false,
            cookie: CookieConfig::default(),
            providers: Vec::new(),
            allowed_emails: Vec::new(),
            rules: Vec::new(),
            forwarding: Vec::new(),
            encryption_key: None,
            email: EmailSettings::default(),
            password: PasswordSettings::default(),
            storage: StorageConfig::default(),
            dev_mode: false,
            title: "Sign in".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn new(cookie_secret: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.cookie.secret = cookie_secret.into();
        config
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_trusted_proxy(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_allowed_emails(mut self, emails: Vec<String>) -> Self {
        self.allowed_emails = emails;
        self
    }

    pub fn with_rules(mut self, rules: Vec<RuleConfig>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_forwarding(mut self, fields: Vec<ForwardingField>, key: Option<String>) -> Self {
        self.forwarding = fields;
        self.encryption_key = key;
        self
    }

    pub fn with_email(mut self, settings: EmailSettings) -> Self {
        self.email = settings;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password.password = Some(password.into());
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    /// Prefix without a trailing slash.
    pub fn prefix(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    /// Whether `email` may sign in. Entries starting with `@` match a domain.
    pub fn is_email_allowed(&self, email: &str) -> bool {
        if self.allowed_emails.is_empty() {
            return true;
        }
        let email = email.trim().to_lowercase();
        self.allowed_emails.iter().any(|allowed| {
            let allowed = allowed.trim().to_lowercase();
            if allowed.starts_with('@') {
                email.ends_with(&allowed)
            } else {
                email == allowed
            }
        })
    }

    pub fn requires_email(&self) -> bool {
        !self.allowed_emails.is_empty()
    }

    /// Check the whole configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();

        if self.cookie.secret.is_empty() {
            errors.push("cookie.secret is required");
        } else if self.cookie.secret.len() < MIN_SECRET_LEN {
            errors.push(format!(
                "cookie.secret must be at least {} bytes",
                MIN_SECRET_LEN
            ));
        }
        if self.cookie.name.is_empty() {
            errors.push("cookie.name is required");
        }
        if self.cookie.max_age_secs <= 0 {
            errors.push("cookie.max_age_secs must be positive");
        }
        if self.cookie.same_site == SameSite::None && !self.cookie.secure {
            errors.push("cookie.same_site = none requires cookie.secure");
        }

        if !self.prefix.starts_with('/') || self.prefix().is_empty() {
            errors.push("prefix must start with '/' and not be the root");
        }
        if let Some(base) = &self.base_url {
            if url::Url::parse(base).is_err() {
                errors.push(format!("base_url {:?} is not a valid URL", base));
            }
        }

        let mut names = HashSet::new();
        for (i, provider) in self.providers.iter().enumerate() {
            if provider.name.is_empty() {
                errors.push(format!("providers[{}]: name is required", i));
            } else if !names.insert(provider.name.as_str()) {
                errors.push(format!("providers[{}]: duplicate name {:?}", i, provider.name));
            }
            if provider.client_id.is_empty() {
                errors.push(format!("providers[{}]: client_id is required", i));
            }
            if provider.kind == ProviderKind::Oidc {
                for (field, value) in [
                    ("auth_url", &provider.auth_url),
                    ("token_url", &provider.token_url),
                    ("userinfo_url", &provider.userinfo_url),
                ] {
                    if value.as_deref().is_none_or(str::is_empty) {
                        errors.push(format!("providers[{}]: {} is required", i, field));
                    }
                }
            }
        }

        if let Err(crate::error::Error::Validation(rule_errors)) = RuleSet::compile(&self.rules) {
            for message in rule_errors.messages() {
                errors.push(message.clone());
            }
        }

        let has_key = self.encryption_key.as_deref().is_some_and(|k| !k.is_empty());
        for (i, field) in self.forwarding.iter().enumerate() {
            if field.path.is_empty() {
                errors.push(format!("forwarding[{}]: path is required", i));
            }
            if field.header.is_none() && field.query.is_none() {
                errors.push(format!("forwarding[{}]: needs a header or query name", i));
            }
            if field.filters.contains(&Filter::Encrypt) && !has_key {
                errors.push(format!(
                    "forwarding[{}]: encrypt filter requires encryption_key",
                    i
                ));
            }
        }

        if self.email.enabled {
            if self.email.token_ttl_secs == 0 {
                errors.push("email.token_ttl_secs must be positive");
            }
            if self.email.rate_limit_per_minute == 0 {
                errors.push("email.rate_limit_per_minute must be positive");
            }
        }
        if self.password.password.as_deref() == Some("") {
            errors.push("password.password must not be empty when set");
        }
        if self.providers.is_empty() && !self.email.enabled && self.password.password.is_none() {
            errors.push("at least one authentication method must be configured");
        }

        errors.into_result()
    }
}
