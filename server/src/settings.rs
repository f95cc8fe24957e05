use authgate::GatewayConfig;
use authgate::store::Backend;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;
use std::path::Path;

/// Process settings: where to listen, what to protect, and the gateway
/// configuration itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen: String,
    /// Base URL of the protected application.
    pub upstream: String,
    #[serde(flatten)]
    pub gateway: GatewayConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4180".to_string(),
            upstream: "http://127.0.0.1:3000".to_string(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Settings {
    /// Read `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw)
                .into_diagnostic()
                .wrap_err_with(|| format!("parsing {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Settings::default()
        };
        settings.apply_overrides(|name| std::env::var(name).ok());
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| var(name).filter(|v| !v.is_empty());

        if let Some(listen) = var("AUTHGATE_LISTEN") {
            self.listen = listen;
        }
        if let Some(upstream) = var("AUTHGATE_UPSTREAM") {
            self.upstream = upstream;
        }
        if let Some(secret) = var("AUTHGATE_COOKIE_SECRET") {
            self.gateway.cookie.secret = secret;
        }
        if let Some(base_url) = var("AUTHGATE_BASE_URL") {
            self.gateway.base_url = Some(base_url);
        }
        if let Some(trust) = var("AUTHGATE_TRUST_FORWARDED_HEADERS") {
            self.gateway.trust_forwarded_headers = matches!(trust.as_str(), "1" | "true" | "yes");
        }
        // Redis wins when both are set.
        if let Some(url) = var("DATABASE_URL") {
            self.gateway.storage.default.backend = Backend::Sqlite { url };
        }
        if let Some(url) = var("REDIS_URL") {
            self.gateway.storage.default.backend = Backend::Redis { url };
        }
    }
}
