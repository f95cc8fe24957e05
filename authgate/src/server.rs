use crate::{
    auth::Identity,
    clock::{Clock, SystemClock},
    config::GatewayConfig,
    cookies::{self, CookieOptions, CookieSigner},
    email::{EmailAuth, EmailMessage, EmailSender, LogEmailSender},
    error::{Error, Result},
    forward::{Forwarder, append_query},
    oauth::{self, CallbackParams},
    pages::{self, LoginPage},
    password::PasswordAuth,
    providers::{ProviderRegistry, http_client_builder},
    rules::{Action, RuleSet},
    session::{Session, SessionManager},
    store::{KeyValueStore, StoreSet},
};
use axum::{
    Form, Router,
    extract::{Path, Query, Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, LOCATION, SET_COOKIE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower::{Service, ServiceExt};

/// Cookie holding the URI to return to after signing in.
pub const REDIRECT_COOKIE: &str = "auth_redirect";
const REDIRECT_COOKIE_MAX_AGE: i64 = 600;

pub const HEADER_AUTHENTICATED: &str = "x-authenticated";
pub const HEADER_AUTH_PROVIDER: &str = "x-auth-provider";

const CSP: &str = "default-src 'none'; style-src 'self'; img-src 'self' data:; \
                   form-action 'self'; frame-ancestors 'none'; base-uri 'none'";
const CSP_DEV: &str = "default-src 'self' 'unsafe-inline' 'unsafe-eval' data: http: https: ws:; \
                       frame-ancestors 'none'";

const STATIC_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "map", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "avif", "woff",
    "woff2", "ttf", "otf", "eot",
];

/// Whether `target` is a same-origin path that is safe to redirect to.
pub fn is_safe_redirect(target: &str) -> bool {
    target.starts_with('/')
        && !target.starts_with("//")
        && !target.starts_with("/\\")
        && !target.contains("://")
}

/// Paths that look like assets are never remembered as a post-login target.
pub fn is_static_resource(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        }
        _ => false,
    }
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    email.len() <= 254
        && !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@')
        && !email.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// 302 to `location` setting every cookie in `cookies`.
fn found(location: &str, cookies: Vec<String>) -> Result<Response> {
    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    headers.insert(
        LOCATION,
        HeaderValue::from_str(location)
            .map_err(|_| Error::Internal(format!("unrepresentable redirect {:?}", location)))?,
    );
    for cookie in cookies {
        let value = HeaderValue::from_str(&cookie)
            .map_err(|_| Error::Internal("unrepresentable cookie".to_string()))?;
        headers.append(SET_COOKIE, value);
    }
    Ok(response)
}

/// The gateway: authentication endpoints plus the guard in front of the
/// upstream application.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    providers: Arc<ProviderRegistry>,
    sessions: SessionManager,
    session_store: Arc<dyn KeyValueStore>,
    email: EmailAuth,
    email_sender: Arc<dyn EmailSender>,
    password: Option<PasswordAuth>,
    rules: Arc<RuleSet>,
    forwarder: Arc<Forwarder>,
    signer: CookieSigner,
    http: reqwest::Client,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Router serving the authentication endpoints under the configured
    /// prefix and guarding every other path in front of `upstream`.
    pub fn router<U>(&self, upstream: U) -> Router
    where
        U: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
        U::Future: Send + 'static,
    {
        let auth = Router::new()
            .route("/login", get(handle_login))
            .route("/logout", get(handle_logout).post(handle_logout))
            .route("/oauth2/start/{provider}", get(handle_oauth_start))
            .route("/oauth2/callback", get(handle_oauth_callback))
            .route("/email/send", post(handle_email_send))
            .route("/email/verify", get(handle_email_verify))
            .route("/email/verify-otp", post(handle_email_verify_otp))
            .route("/password/login", post(handle_password_login))
            .route("/static/{*path}", get(handle_static))
            .route("/health", get(handle_health))
            .route("/ready", get(handle_ready))
            .fallback(handle_not_found)
            .layer(middleware::map_response_with_state(
                self.clone(),
                security_headers,
            ));

        Router::new()
            .nest(self.config.prefix(), auth)
            .fallback(move |State(gateway): State<Gateway>, request: Request| {
                let upstream = upstream.clone();
                async move { gateway.guard(request, upstream).await }
            })
            .with_state(self.clone())
    }

    fn login_url(&self) -> String {
        format!("{}/login", self.config.prefix())
    }

    fn flow_cookie_options(&self) -> CookieOptions {
        CookieOptions {
            path: self.config.prefix().to_string(),
            domain: self.config.cookie.domain.clone(),
            max_age: Some(oauth::FLOW_COOKIE_MAX_AGE),
            secure: self.config.cookie.secure,
            http_only: true,
            same_site: cookies::SameSite::Lax,
        }
    }

    fn redirect_cookie_options(&self) -> CookieOptions {
        CookieOptions {
            max_age: Some(REDIRECT_COOKIE_MAX_AGE),
            http_only: true,
            same_site: cookies::SameSite::Lax,
            ..self.config.cookie.options()
        }
    }

    /// Verified value of a signed cookie.
    fn signed_cookie<'a>(&self, headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
        let raw = cookies::read_cookie(headers, name)?;
        let value = self.signer.verify(raw);
        if value.is_none() {
            tracing::info!(cookie = name, "ignoring cookie with bad signature");
        }
        value
    }

    /// The caller's valid session. Storage failures count as no session.
    async fn current_session(&self, headers: &HeaderMap) -> Option<Session> {
        let id = self.signed_cookie(headers, &self.config.cookie.name)?;
        let session = match self.sessions.get(id).await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("session lookup failed, treating as signed out: {}", e);
                return None;
            }
        };
        if session.is_valid(self.sessions.now()) {
            return Some(session);
        }
        if let Err(e) = self.sessions.delete(&session.id).await {
            tracing::warn!("could not delete expired session: {}", e);
        }
        None
    }

    async fn guard<U>(&self, request: Request, upstream: U) -> Response
    where
        U: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
        U::Future: Send + 'static,
    {
        let path = request.uri().path().to_string();
        match self.rules.evaluate(&path) {
            Action::Allow => forward(upstream, request).await,
            Action::Deny => {
                tracing::info!(path = %path, "request denied by rule");
                Error::Forbidden(format!("{} denied by rule", path)).into_response()
            }
            Action::Auth => match self.current_session(request.headers()).await {
                Some(session) => {
                    let request = self.attach_identity(request, &session);
                    forward(upstream, request).await
                }
                None => self
                    .redirect_to_login(&request)
                    .unwrap_or_else(IntoResponse::into_response),
            },
        }
    }

    fn attach_identity(&self, mut request: Request, session: &Session) -> Request {
        let identity = session.identity();
        let forwarded = self.forwarder.apply(&identity);
        let headers = request.headers_mut();

        // never trust identity headers sent by the client
        headers.remove(HEADER_AUTHENTICATED);
        headers.remove(HEADER_AUTH_PROVIDER);
        for name in self.forwarder.header_names() {
            headers.remove(name);
        }

        headers.insert(
            HeaderName::from_static(HEADER_AUTHENTICATED),
            HeaderValue::from_static("true"),
        );
        if let Ok(provider) = HeaderValue::from_str(&session.provider) {
            headers.insert(HeaderName::from_static(HEADER_AUTH_PROVIDER), provider);
        }
        for (name, value) in forwarded.headers {
            headers.insert(name, value);
        }

        request.extensions_mut().insert(identity);
        request
    }

    fn redirect_to_login(&self, request: &Request) -> Result<Response> {
        let mut cookies = Vec::new();
        let path = request.uri().path();
        let pending = cookies::read_cookie(request.headers(), REDIRECT_COOKIE).is_some();
        if !pending && !is_static_resource(path) {
            let target = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or(path);
            let value = self.signer.sign(&urlencoding::encode(target));
            cookies.push(cookies::set_cookie(
                REDIRECT_COOKIE,
                &value,
                &self.redirect_cookie_options(),
            ));
        }
        found(&self.login_url(), cookies)
    }

    fn origin(&self, headers: &HeaderMap) -> Result<String> {
        oauth::external_origin(
            self.config.base_url.as_deref(),
            headers,
            self.config.trust_forwarded_headers,
        )
    }

    /// Where to send the user after signing in.
    fn post_login_target(&self, headers: &HeaderMap) -> String {
        self.signed_cookie(headers, REDIRECT_COOKIE)
            .and_then(|v| urlencoding::decode(v).ok())
            .map(|v| v.into_owned())
            .filter(|v| is_safe_redirect(v))
            .unwrap_or_else(|| "/".to_string())
    }

    /// Apply the email allow-list to an identity.
    fn authorize(&self, identity: &Identity) -> Result<()> {
        if !self.config.requires_email() {
            return Ok(());
        }
        if !identity.has_email() {
            return Err(Error::EmailNotFound);
        }
        if !self.config.is_email_allowed(&identity.email) {
            return Err(Error::Forbidden(format!(
                "{} is not on the allow-list",
                identity.email
            )));
        }
        Ok(())
    }

    /// Replace any existing session with a new one for `identity` and send
    /// the browser back where it started.
    async fn establish_session(
        &self,
        headers: &HeaderMap,
        identity: Identity,
        mut cookies: Vec<String>,
    ) -> Result<Response> {
        if let Some(previous) = self.signed_cookie(headers, &self.config.cookie.name) {
            if let Err(e) = self.sessions.delete(previous).await {
                tracing::warn!("could not delete previous session: {}", e);
            }
        }

        let lifetime = chrono::Duration::seconds(self.config.cookie.max_age_secs);
        let session = Session::issue(&identity, lifetime, self.sessions.now());
        self.sessions.create(&session).await?;
        tracing::info!(
            provider = %session.provider,
            email = %session.email,
            "session established"
        );

        let forwarded = self.forwarder.apply(&identity);
        let target = append_query(&self.post_login_target(headers), &forwarded.query);

        cookies.push(cookies::expire_cookie(
            REDIRECT_COOKIE,
            &self.redirect_cookie_options(),
        ));
        cookies.push(cookies::set_cookie(
            &self.config.cookie.name,
            &self.signer.sign(&session.id),
            &self.config.cookie.options(),
        ));
        found(&target, cookies)
    }

    async fn send_email_token(&self, headers: &HeaderMap, email: &str) -> Result<()> {
        let token = match self.email.issue(email).await {
            Ok(token) => token,
            // the response must not reveal throttling
            Err(Error::RateLimited) => return Ok(()),
            Err(e) => return Err(e),
        };
        let origin = self.origin(headers)?;
        let message = EmailMessage {
            to_email: token.email.clone(),
            subject: self.config.email.subject.clone(),
            magic_link: format!(
                "{}{}/email/verify?token={}",
                origin,
                self.config.prefix(),
                urlencoding::encode(&token.value)
            ),
            otp: token.otp.clone(),
            expires_at: token.expires_at,
        };
        self.email_sender.send(&message).await
    }

    async fn complete_email_login(&self, headers: &HeaderMap, email: String) -> Result<Response> {
        let identity = Identity::new("email", email.clone())
            .with_username(email)
            .with_standard_attributes(None);
        self.authorize(&identity)?;
        self.establish_session(headers, identity, Vec::new()).await
    }
}

async fn forward<U>(upstream: U, request: Request) -> Response
where
    U: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
    U::Future: Send + 'static,
{
    upstream
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {})
}

async fn security_headers(State(gateway): State<Gateway>, mut response: Response) -> Response {
    let csp = if gateway.config.dev_mode { CSP_DEV } else { CSP };
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static(csp),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if !headers.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    response
}

// Handler functions

async fn handle_login(State(gateway): State<Gateway>) -> Response {
    let config = &gateway.config;
    LoginPage {
        prefix: config.prefix(),
        title: &config.title,
        providers: gateway
            .providers
            .iter()
            .map(|p| (p.name(), p.config().label()))
            .collect(),
        email: config.email.enabled,
        password: gateway.password.is_some(),
    }
    .render()
    .into_response()
}

async fn handle_logout(State(gateway): State<Gateway>, headers: HeaderMap) -> Result<Response> {
    if let Some(id) = gateway.signed_cookie(&headers, &gateway.config.cookie.name) {
        match gateway.sessions.delete(id).await {
            Ok(()) => tracing::info!("session ended"),
            Err(e) => tracing::warn!("could not delete session on logout: {}", e),
        }
    }
    let expired = cookies::expire_cookie(&gateway.config.cookie.name, &gateway.config.cookie.options());
    found(&gateway.login_url(), vec![expired])
}

async fn handle_oauth_start(
    State(gateway): State<Gateway>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let provider = gateway.providers.get(&provider_name)?;
    let origin = gateway.origin(&headers)?;
    let redirect_uri = oauth::callback_url(&origin, gateway.config.prefix());
    let state = oauth::generate_state();
    let url = oauth::authorization_url(provider.as_ref(), &redirect_uri, &state)?;

    tracing::info!(provider = %provider_name, "starting oauth flow");

    let options = gateway.flow_cookie_options();
    let signer = &gateway.signer;
    let cookies = vec![
        cookies::set_cookie(oauth::STATE_COOKIE, &signer.sign(&state), &options),
        cookies::set_cookie(oauth::PROVIDER_COOKIE, &signer.sign(&provider_name), &options),
        cookies::set_cookie(
            oauth::REDIRECT_URL_COOKIE,
            &signer.sign(&urlencoding::encode(&redirect_uri)),
            &options,
        ),
    ];
    found(url.as_str(), cookies)
}

async fn handle_oauth_callback(
    State(gateway): State<Gateway>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Result<Response> {
    if let Some(error) = params.error {
        tracing::warn!(
            "provider returned error: {} {}",
            error,
            params.error_description.unwrap_or_default()
        );
        return Err(Error::InvalidRequest(format!("provider error: {}", error)));
    }

    let expected_state = gateway
        .signed_cookie(&headers, oauth::STATE_COOKIE)
        .ok_or(Error::StateMismatch)?;
    let provider_name = gateway
        .signed_cookie(&headers, oauth::PROVIDER_COOKIE)
        .ok_or(Error::StateMismatch)?;
    let redirect_uri = gateway
        .signed_cookie(&headers, oauth::REDIRECT_URL_COOKIE)
        .and_then(|v| urlencoding::decode(v).ok())
        .ok_or(Error::StateMismatch)?;

    let state = params.state.unwrap_or_default();
    if !bool::from(state.as_bytes().ct_eq(expected_state.as_bytes())) {
        tracing::warn!(provider = %provider_name, "oauth state mismatch");
        return Err(Error::StateMismatch);
    }
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or(Error::MissingAuthorizationCode)?;

    let provider = gateway.providers.get(provider_name)?;
    let access_token =
        oauth::exchange_code(&gateway.http, provider.as_ref(), &code, &redirect_uri).await?;
    let info = provider.user_info(&gateway.http, &access_token).await?;
    let identity = info.into_identity(provider.name());
    gateway.authorize(&identity)?;

    let options = gateway.flow_cookie_options();
    let cleared = vec![
        cookies::expire_cookie(oauth::STATE_COOKIE, &options),
        cookies::expire_cookie(oauth::PROVIDER_COOKIE, &options),
        cookies::expire_cookie(oauth::REDIRECT_URL_COOKIE, &options),
    ];
    gateway.establish_session(&headers, identity, cleared).await
}

#[derive(Debug, Deserialize)]
struct EmailForm {
    email: String,
}

async fn handle_email_send(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Form(form): Form<EmailForm>,
) -> Result<Response> {
    if !gateway.config.email.enabled {
        return Ok(handle_not_found().await);
    }
    let email = form.email.trim();
    if !looks_like_email(email) {
        return Err(Error::InvalidRequest("invalid email address".to_string()));
    }

    if gateway.config.is_email_allowed(email) {
        gateway.send_email_token(&headers, email).await?;
    } else {
        tracing::info!(email = %email, "sign-in email requested for address not on allow-list");
    }
    Ok(pages::check_inbox(gateway.config.prefix()).into_response())
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: String,
}

async fn handle_email_verify(
    State(gateway): State<Gateway>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    if !gateway.config.email.enabled {
        return Ok(handle_not_found().await);
    }
    if query.token.is_empty() {
        return Err(Error::InvalidToken);
    }
    let email = gateway.email.verify_token(&query.token).await?;
    gateway.complete_email_login(&headers, email).await
}

#[derive(Debug, Deserialize)]
struct OtpForm {
    otp: String,
}

async fn handle_email_verify_otp(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Form(form): Form<OtpForm>,
) -> Result<Response> {
    if !gateway.config.email.enabled {
        return Ok(handle_not_found().await);
    }
    let email = gateway.email.verify_otp(&form.otp).await?;
    gateway.complete_email_login(&headers, email).await
}

#[derive(Debug, Deserialize)]
struct PasswordForm {
    password: String,
    #[serde(default)]
    email: String,
}

async fn handle_password_login(
    State(gateway): State<Gateway>,
    headers: HeaderMap,
    Form(form): Form<PasswordForm>,
) -> Result<Response> {
    let Some(password) = gateway.password.as_ref() else {
        return Ok(handle_not_found().await);
    };
    password.verify(&form.password)?;

    let identity = password.identity(&form.email);
    gateway.authorize(&identity)?;
    gateway.establish_session(&headers, identity, Vec::new()).await
}

async fn handle_static(Path(path): Path<String>) -> Response {
    match pages::asset(&path) {
        Some(response) => response,
        None => handle_not_found().await,
    }
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_ready(State(gateway): State<Gateway>) -> Response {
    match gateway.session_store.exists("__ready__").await {
        Ok(_) => (StatusCode::OK, "ready").into_response(),
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "session store unavailable").into_response()
        }
    }
}

async fn handle_not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

/// Builder for [`Gateway`].
#[derive(Default)]
pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    providers: Option<ProviderRegistry>,
    stores: Option<StoreSet>,
    email_sender: Option<Arc<dyn EmailSender>>,
    clock: Option<Arc<dyn Clock>>,
    http: Option<reqwest::Client>,
}

impl GatewayBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this registry instead of building one from the configuration.
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn stores(mut self, stores: StoreSet) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn email_sender(mut self, sender: Arc<dyn EmailSender>) -> Self {
        self.email_sender = Some(sender);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let config = self
            .config
            .ok_or_else(|| Error::InvalidRequest("config required".to_string()))?;
        config.validate()?;

        let providers = match self.providers {
            Some(providers) => providers,
            None => ProviderRegistry::from_configs(&config.providers)?,
        };
        let stores = self.stores.unwrap_or_else(StoreSet::in_memory);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let http = match self.http {
            Some(http) => http,
            None => http_client_builder().build()?,
        };
        let rules = RuleSet::compile(&config.rules)?;
        let forwarder = Forwarder::new(config.forwarding.clone(), config.encryption_key.as_deref());
        let email = EmailAuth::new(
            stores.tokens.clone(),
            stores.ratelimit.clone(),
            clock.clone(),
            &config.cookie.secret,
            &config.email,
        );

        Ok(Gateway {
            signer: CookieSigner::new(&config.cookie.secret),
            sessions: SessionManager::new(stores.sessions.clone(), clock),
            session_store: stores.sessions,
            providers: Arc::new(providers),
            email,
            email_sender: self.email_sender.unwrap_or_else(|| Arc::new(LogEmailSender)),
            password: PasswordAuth::from_settings(&config.password),
            rules: Arc::new(rules),
            forwarder: Arc::new(forwarder),
            http,
            config: Arc::new(config),
        })
    }
}
