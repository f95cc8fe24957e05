//! Authorization-code flow: building the provider redirect and exchanging
//! the returned code for an access token.

use crate::error::{Error, Result};
use crate::providers::Provider;
use axum::http::HeaderMap;
use axum::http::header::HOST;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use url::Url;

/// Cookie carrying the CSRF state.
pub const STATE_COOKIE: &str = "oauth_state";
/// Cookie carrying the provider the flow was started with.
pub const PROVIDER_COOKIE: &str = "oauth_provider";
/// Cookie carrying the redirect URI sent to the provider.
pub const REDIRECT_URL_COOKIE: &str = "oauth_redirect_url";
/// Lifetime of the flow cookies, in seconds.
pub const FLOW_COOKIE_MAX_AGE: i64 = 600;

/// 32 random bytes, URL-safe encoded.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Public origin of the gateway: the configured base URL, or the request's
/// `Host` over plain http. With `trust_forwarded` set, `X-Forwarded-Host` and
/// `X-Forwarded-Proto` take precedence.
pub fn external_origin(
    base_url: Option<&str>,
    headers: &HeaderMap,
    trust_forwarded: bool,
) -> Result<String> {
    if let Some(base) = base_url.filter(|b| !b.is_empty()) {
        return Ok(base.trim_end_matches('/').to_string());
    }
    let forwarded = |name: &str| {
        headers
            .get(name)
            .filter(|_| trust_forwarded)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let host = forwarded("x-forwarded-host")
        .or_else(|| headers.get(HOST).and_then(|v| v.to_str().ok()))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidRequest("missing Host header".to_string()))?;
    let scheme = forwarded("x-forwarded-proto")
        .filter(|s| *s == "https" || *s == "http")
        .unwrap_or("http");
    Ok(format!("{}://{}", scheme, host))
}

/// Callback URL registered with the provider.
pub fn callback_url(origin: &str, prefix: &str) -> String {
    format!("{}{}/oauth2/callback", origin, prefix)
}

/// Provider authorization URL for this flow.
pub fn authorization_url(provider: &dyn Provider, redirect_uri: &str, state: &str) -> Result<Url> {
    let mut url = Url::parse(provider.authorize_url()).map_err(|e| {
        Error::Provider(format!(
            "invalid authorization endpoint for {}: {}",
            provider.name(),
            e
        ))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &provider.config().client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &provider.scopes().join(" "))
            .append_pair("state", state);
        for (key, value) in provider.authorize_params() {
            query.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Query parameters the provider sends back to the callback.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchange an authorization code for an access token. `redirect_uri` must
/// be the one sent in the authorization request.
pub async fn exchange_code(
    http: &reqwest::Client,
    provider: &dyn Provider,
    code: &str,
    redirect_uri: &str,
) -> Result<String> {
    let http = provider.http_client().unwrap_or(http);
    let config = provider.config();
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
    ];

    let response = http
        .post(provider.token_url())
        .header(ACCEPT, "application/json")
        .form(&form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Provider(format!(
            "token endpoint of {} returned {}: {}",
            provider.name(),
            status,
            body
        )));
    }

    let token: TokenResponse = response.json().await?;
    if let Some(error) = token.error {
        return Err(Error::Provider(format!(
            "token endpoint of {} rejected the code: {} {}",
            provider.name(),
            error,
            token.error_description.unwrap_or_default()
        )));
    }
    token
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Provider(format!("{} returned no access token", provider.name())))
}
