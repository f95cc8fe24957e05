// HTTP-level tests driving the gateway router with tower::ServiceExt::oneshot,
// with a small echo application standing in for the upstream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use authgate::cookies::CookieSigner;
use authgate::email::EmailMessage;
use authgate::forward::FieldCipher;
use authgate::{
    Action, EmailSender, EmailSettings, Filter, ForwardingField, Gateway, GatewayConfig,
    KeyValueStore, ProviderConfig, ProviderKind, RuleConfig, StoreSet,
};
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "test-cookie-secret-0123456789abcdef";
const PASSWORD: &str = "correct horse battery staple";

/// Upstream that echoes the identity headers it received.
fn upstream() -> Router {
    Router::new().fallback(|headers: HeaderMap| async move {
        let mut lines: Vec<String> = headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-"))
            .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("?")))
            .collect();
        lines.sort();
        format!("upstream\n{}", lines.join("\n"))
    })
}

#[derive(Default)]
struct CapturingSender {
    sent: Mutex<Vec<EmailMessage>>,
}

impl CapturingSender {
    fn last(&self) -> EmailMessage {
        self.sent.lock().unwrap().last().cloned().expect("no email sent")
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl EmailSender for CapturingSender {
    async fn send(&self, message: &EmailMessage) -> authgate::Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Store whose every operation fails.
struct BrokenStore;

#[async_trait]
impl KeyValueStore for BrokenStore {
    fn name(&self) -> &'static str {
        "broken"
    }
    async fn get(&self, _: &str) -> authgate::Result<Option<Vec<u8>>> {
        Err(authgate::Error::Storage("backend down".into()))
    }
    async fn set(&self, _: &str, _: &[u8], _: Duration) -> authgate::Result<()> {
        Err(authgate::Error::Storage("backend down".into()))
    }
    async fn delete(&self, _: &str) -> authgate::Result<()> {
        Err(authgate::Error::Storage("backend down".into()))
    }
    async fn compare_and_swap(
        &self,
        _: &str,
        _: Option<&[u8]>,
        _: &[u8],
        _: Duration,
    ) -> authgate::Result<bool> {
        Err(authgate::Error::Storage("backend down".into()))
    }
    async fn list(&self, _: &str) -> authgate::Result<Vec<String>> {
        Err(authgate::Error::Storage("backend down".into()))
    }
}

fn password_config() -> GatewayConfig {
    GatewayConfig::new(SECRET)
        .with_password(PASSWORD)
        .with_base_url("https://app.example.com")
}

fn app(config: GatewayConfig, stores: StoreSet) -> Router {
    Gateway::builder()
        .config(config)
        .stores(stores)
        .build()
        .unwrap()
        .router(upstream())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_cookies(uri: &str, cookies: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, cookies)
        .body(Body::empty())
        .unwrap()
}

fn post_form(uri: &str, body: &str, cookies: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::HOST, "app.example.com")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookies) = cookies {
        builder = builder.header(header::COOKIE, cookies);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn location(response: &Response) -> &str {
    response.headers()[header::LOCATION].to_str().unwrap()
}

fn set_cookies(response: &Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

/// `name=value` pairs of the cookies a response sets, ignoring expirations.
fn cookie_pairs(response: &Response) -> Vec<String> {
    set_cookies(response)
        .into_iter()
        .filter(|c| !c.contains("Max-Age=0"))
        .filter_map(|c| c.split(';').next().map(str::to_string))
        .collect()
}

fn cookie_named<'a>(pairs: &'a [String], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|p| p.starts_with(&format!("{}=", name)))
        .map(String::as_str)
}

fn signed_redirect_cookie(target: &str) -> String {
    let signer = CookieSigner::new(SECRET);
    format!(
        "auth_redirect={}",
        signer.sign(&urlencoding::encode(target))
    )
}

async fn password_login(app: &Router, cookies: Option<&str>) -> Response {
    let body = format!("password={}", urlencoding::encode(PASSWORD));
    send(app, post_form("/_auth/password/login", &body, cookies)).await
}

#[tokio::test]
async fn anonymous_request_redirects_and_remembers_target() {
    let app = app(password_config(), StoreSet::in_memory());

    let response = send(&app, get("/dashboard?tab=2")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/_auth/login");

    let cookies = set_cookies(&response);
    let redirect = cookies
        .iter()
        .find(|c| c.starts_with("auth_redirect="))
        .expect("redirect cookie");
    assert!(redirect.contains("HttpOnly"));
    assert!(redirect.contains("Max-Age=600"));

    let value = redirect.split(';').next().unwrap().trim_start_matches("auth_redirect=");
    let verified = CookieSigner::new(SECRET).verify(value).unwrap();
    assert_eq!(urlencoding::decode(verified).unwrap(), "/dashboard?tab=2");
}

#[tokio::test]
async fn static_paths_and_pending_targets_are_not_remembered() {
    let app = app(password_config(), StoreSet::in_memory());

    let response = send(&app, get("/assets/app.js")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(set_cookies(&response).is_empty());

    let pending = signed_redirect_cookie("/first");
    let response = send(&app, get_with_cookies("/second", &pending)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(set_cookies(&response).is_empty());
}

#[tokio::test]
async fn rules_allow_and_deny_without_a_session() {
    let config = password_config().with_rules(vec![
        RuleConfig {
            prefix: Some("/public".into()),
            action: Action::Allow,
            ..Default::default()
        },
        RuleConfig {
            glob: Some("/admin/**".into()),
            action: Action::Deny,
            ..Default::default()
        },
    ]);
    let app = app(config, StoreSet::in_memory());

    let response = send(&app, get("/public/page")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.starts_with("upstream"));
    assert!(!body.contains("x-authenticated"));

    let response = send(&app, get("/admin/users")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(&app, get("/private")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn auth_pages_carry_security_headers() {
    let app_strict = app(password_config(), StoreSet::in_memory());
    let response = send(&app_strict, get("/_auth/login")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert!(headers["content-security-policy"].to_str().unwrap().starts_with("default-src 'none'"));
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
    let page = body_text(response).await;
    assert!(page.contains("/_auth/password/login"));

    let app_dev = app(password_config().with_dev_mode(true), StoreSet::in_memory());
    let response = send(&app_dev, get("/_auth/login")).await;
    assert!(response.headers()["content-security-policy"]
        .to_str()
        .unwrap()
        .contains("'unsafe-inline'"));

    let response = send(&app_strict, get("/_auth/static/style.css")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=3600");

    let response = send(&app_strict, get("/_auth/nope")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
}

#[tokio::test]
async fn health_and_readiness() {
    let app_ok = app(password_config(), StoreSet::in_memory());
    let response = send(&app_ok, get("/_auth/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
    assert_eq!(send(&app_ok, get("/_auth/ready")).await.status(), StatusCode::OK);

    let mut stores = StoreSet::in_memory();
    stores.sessions = Arc::new(BrokenStore);
    let app_down = app(password_config(), stores);
    assert_eq!(
        send(&app_down, get("/_auth/ready")).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
}

#[tokio::test]
async fn password_login_honors_safe_redirect_and_logout_ends_session() {
    let stores = StoreSet::in_memory();
    let app = app(password_config(), stores.clone());

    let redirect = signed_redirect_cookie("/reports?year=2024");
    let response = password_login(&app, Some(&redirect)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/reports?year=2024");
    assert!(set_cookies(&response)
        .iter()
        .any(|c| c.starts_with("auth_redirect=;") && c.contains("Max-Age=0")));

    let pairs = cookie_pairs(&response);
    let session = cookie_named(&pairs, "authgate_session").expect("session cookie").to_string();
    assert_eq!(stores.sessions.count("").await.unwrap(), 1);

    let response = send(&app, get_with_cookies("/reports", &session)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("x-authenticated: true"));
    assert!(body.contains("x-auth-provider: password"));

    let response = send(&app, get_with_cookies("/_auth/logout", &session)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/_auth/login");
    assert!(set_cookies(&response)
        .iter()
        .any(|c| c.starts_with("authgate_session=;") && c.contains("Max-Age=0")));
    assert_eq!(stores.sessions.count("").await.unwrap(), 0);

    let response = send(&app, get_with_cookies("/reports", &session)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn signing_in_again_replaces_the_previous_session() {
    let stores = StoreSet::in_memory();
    let app = app(password_config(), stores.clone());

    let first = cookie_pairs(&password_login(&app, None).await);
    let old = cookie_named(&first, "authgate_session").unwrap().to_string();
    assert_eq!(stores.sessions.count("").await.unwrap(), 1);

    let response = password_login(&app, Some(&old)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let second = cookie_pairs(&response);
    let new = cookie_named(&second, "authgate_session").unwrap().to_string();
    assert_ne!(old, new);
    assert_eq!(stores.sessions.count("").await.unwrap(), 1);

    let response = send(&app, get_with_cookies("/reports", &old)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/_auth/login");
    let response = send(&app, get_with_cookies("/reports", &new)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unsafe_redirect_targets_fall_back_to_root() {
    let app = app(password_config(), StoreSet::in_memory());
    for target in ["//evil.com", "http://evil.com", "/x?next=https://evil.com"] {
        let cookie = signed_redirect_cookie(target);
        let response = password_login(&app, Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/", "target {target:?}");
    }

    // tampered cookies are ignored as well
    let response = password_login(&app, Some("auth_redirect=%2Fadmin.forged")).await;
    assert_eq!(location(&response), "/");
}

#[tokio::test]
async fn wrong_password_is_forbidden() {
    let stores = StoreSet::in_memory();
    let app = app(password_config(), stores.clone());
    let response = send(&app, post_form("/_auth/password/login", "password=nope", None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(cookie_pairs(&response).is_empty());
    assert_eq!(stores.sessions.count("").await.unwrap(), 0);
}

#[tokio::test]
async fn session_store_failures() {
    let mut stores = StoreSet::in_memory();
    stores.sessions = Arc::new(BrokenStore);
    let app = app(password_config(), stores);

    // a failing lookup reads as signed out
    let session = format!("authgate_session={}", CookieSigner::new(SECRET).sign("abc"));
    let response = send(&app, get_with_cookies("/dashboard", &session)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/_auth/login");

    // a failing create is a server error
    let response = password_login(&app, None).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_text(response).await.contains("backend down"));
}

#[tokio::test]
async fn client_supplied_identity_headers_are_replaced() {
    let config = password_config().with_forwarding(
        vec![ForwardingField::header("provider", "X-Forwarded-User-Provider")],
        None,
    );
    let app = app(config, StoreSet::in_memory());
    let response = password_login(&app, None).await;
    let pairs = cookie_pairs(&response);
    let session = cookie_named(&pairs, "authgate_session").unwrap();

    let request = Request::builder()
        .uri("/")
        .header(header::COOKIE, session)
        .header("x-auth-provider", "google")
        .header("x-forwarded-user-provider", "spoofed")
        .body(Body::empty())
        .unwrap();
    let body = body_text(send(&app, request).await).await;
    assert!(body.contains("x-auth-provider: password"));
    assert!(body.contains("x-forwarded-user-provider: password"));
    assert!(!body.contains("spoofed"));
    assert!(!body.contains("google"));
}

fn oidc_config(server: &MockServer) -> GatewayConfig {
    GatewayConfig::new(SECRET)
        .with_base_url("https://app.example.com")
        .with_provider(
            ProviderConfig::new("corp", ProviderKind::Oidc)
                .with_client("client-id", "client-secret")
                .with_endpoints(
                    format!("{}/authorize", server.uri()),
                    format!("{}/token", server.uri()),
                    format!("{}/userinfo", server.uri()),
                ),
        )
}

#[tokio::test]
async fn oauth_callback_with_wrong_state_creates_no_session() {
    let server = MockServer::start().await;
    let stores = StoreSet::in_memory();
    let app = app(oidc_config(&server), stores.clone());

    let signer = CookieSigner::new(SECRET);
    let cookies = format!(
        "oauth_state={}; oauth_provider={}; oauth_redirect_url={}",
        signer.sign("correct"),
        signer.sign("corp"),
        signer.sign(&urlencoding::encode("https://app.example.com/_auth/oauth2/callback")),
    );
    let response = send(
        &app,
        get_with_cookies("/_auth/oauth2/callback?code=abc&state=wrong", &cookies),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(cookie_named(&cookie_pairs(&response), "authgate_session").is_none());
    assert_eq!(stores.sessions.count("").await.unwrap(), 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn oauth_callback_edge_cases() {
    let server = MockServer::start().await;
    let app = app(oidc_config(&server), StoreSet::in_memory());

    // no flow cookies at all
    let response = send(&app, get("/_auth/oauth2/callback?code=abc&state=s")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // provider reported an error
    let response = send(&app, get("/_auth/oauth2/callback?error=access_denied")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // state matches but the code is missing
    let signer = CookieSigner::new(SECRET);
    let cookies = format!(
        "oauth_state={}; oauth_provider={}; oauth_redirect_url={}",
        signer.sign("s"),
        signer.sign("corp"),
        signer.sign("https%3A%2F%2Fapp.example.com%2F_auth%2Foauth2%2Fcallback"),
    );
    let response = send(&app, get_with_cookies("/_auth/oauth2/callback?state=s", &cookies)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, get("/_auth/oauth2/start/unknown")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .unwrap();
    out
}

#[tokio::test]
async fn full_oidc_flow_forwards_identity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "provider-access-token",
            "token_type": "bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sub": "1815",
            "email": "ada@example.com",
            "given_name": "Ada",
            "family_name": "Lovelace",
            "org": {"team": "engines"}
        })))
        .mount(&server)
        .await;

    let config = oidc_config(&server).with_forwarding(
        vec![
            ForwardingField::header("email", "X-Forwarded-Email"),
            ForwardingField::header("extra.org.team", "X-Team"),
            ForwardingField::header(".", "X-Identity").with_filters(vec![Filter::Encrypt, Filter::Zip]),
        ],
        Some("forwarding-key".to_string()),
    );
    let stores = StoreSet::in_memory();
    let app = app(config, stores.clone());

    let response = send(&app, get("/_auth/oauth2/start/corp")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let authorize = url::Url::parse(location(&response)).unwrap();
    assert_eq!(authorize.path(), "/authorize");
    let param = |name: &str| {
        authorize
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    assert_eq!(param("client_id").as_deref(), Some("client-id"));
    assert_eq!(
        param("redirect_uri").as_deref(),
        Some("https://app.example.com/_auth/oauth2/callback")
    );
    let state = param("state").expect("state parameter");

    let flow = set_cookies(&response);
    assert_eq!(flow.len(), 3);
    assert!(flow.iter().all(|c| c.contains("HttpOnly") && c.contains("Max-Age=600")));

    let mut cookies = cookie_pairs(&response);
    cookies.push(signed_redirect_cookie("/dashboard"));
    let callback = format!(
        "/_auth/oauth2/callback?code=the-code&state={}",
        urlencoding::encode(&state)
    );
    let response = send(&app, get_with_cookies(&callback, &cookies.join("; "))).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/dashboard");

    let expired: Vec<String> = set_cookies(&response)
        .into_iter()
        .filter(|c| c.contains("Max-Age=0"))
        .collect();
    for name in ["oauth_state", "oauth_provider", "oauth_redirect_url", "auth_redirect"] {
        assert!(expired.iter().any(|c| c.starts_with(&format!("{}=;", name))), "{name} not cleared");
    }

    let pairs = cookie_pairs(&response);
    let session = cookie_named(&pairs, "authgate_session").unwrap();
    assert_eq!(stores.sessions.count("").await.unwrap(), 1);

    let response = send(&app, get_with_cookies("/dashboard", session)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("x-authenticated: true"));
    assert!(body.contains("x-auth-provider: corp"));
    assert!(body.contains("x-forwarded-email: ada@example.com"));
    assert!(body.contains("x-team: engines"));

    let wire = body
        .lines()
        .find_map(|l| l.strip_prefix("x-identity: "))
        .expect("identity header");
    let encrypted = String::from_utf8(gunzip(&STANDARD.decode(wire).unwrap())).unwrap();
    let plain = FieldCipher::new("forwarding-key").decrypt(&encrypted).unwrap();
    let identity: authgate::Identity = serde_json::from_slice(&plain).unwrap();
    assert_eq!(identity.email, "ada@example.com");
    assert_eq!(identity.username, "Ada Lovelace");
    assert_eq!(identity.provider, "corp");
}

/// Provider whose token endpoint always succeeds and whose userinfo
/// endpoint returns `userinfo`.
async fn provider_returning(userinfo: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "t"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(userinfo))
        .mount(&server)
        .await;
    server
}

/// Start the flow at provider `corp` and return the callback response.
async fn oauth_sign_in(app: &Router) -> Response {
    let response = send(app, get("/_auth/oauth2/start/corp")).await;
    let authorize = url::Url::parse(location(&response)).unwrap();
    let state = authorize
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let cookies = cookie_pairs(&response).join("; ");
    let callback = format!("/_auth/oauth2/callback?code=c&state={}", urlencoding::encode(&state));
    send(app, get_with_cookies(&callback, &cookies)).await
}

#[tokio::test]
async fn oauth_allow_list_rejects_other_accounts() {
    let server = provider_returning(serde_json::json!({"email": "eve@evil.example"})).await;
    let stores = StoreSet::in_memory();
    let config = oidc_config(&server).with_allowed_emails(vec!["@example.com".into()]);
    let app = app(config, stores.clone());

    let response = oauth_sign_in(&app).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(body_text(response).await.contains("not allowed to access"));
    assert_eq!(stores.sessions.count("").await.unwrap(), 0);
}

#[tokio::test]
async fn callback_origin_ignores_forwarded_host_unless_trusted() {
    let server = MockServer::start().await;
    let mut config = oidc_config(&server);
    config.base_url = None;

    let start = || {
        Request::builder()
            .uri("/_auth/oauth2/start/corp")
            .header(header::HOST, "app.example.com")
            .header("x-forwarded-host", "evil.example")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap()
    };
    let redirect_uri = |response: &Response| {
        url::Url::parse(location(response))
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    };

    let untrusted = app(config.clone(), StoreSet::in_memory());
    let response = send(&untrusted, start()).await;
    assert_eq!(redirect_uri(&response), "http://app.example.com/_auth/oauth2/callback");

    let trusted = app(config.with_trusted_proxy(true), StoreSet::in_memory());
    let response = send(&trusted, start()).await;
    assert_eq!(redirect_uri(&response), "https://evil.example/_auth/oauth2/callback");
}

#[tokio::test]
async fn identity_without_email_signs_in_when_no_allow_list() {
    let server =
        provider_returning(serde_json::json!({"sub": "1815", "preferred_username": "ada"})).await;
    let stores = StoreSet::in_memory();
    let config = oidc_config(&server).with_forwarding(vec![ForwardingField::query("username", "u")], None);
    let app = app(config, stores.clone());

    let response = oauth_sign_in(&app).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/?u=ada");
    assert_eq!(stores.sessions.count("").await.unwrap(), 1);
}

#[tokio::test]
async fn identity_without_email_is_refused_by_allow_list() {
    let server =
        provider_returning(serde_json::json!({"sub": "1815", "preferred_username": "ada"})).await;
    let stores = StoreSet::in_memory();
    let config = oidc_config(&server).with_allowed_emails(vec!["@example.com".into()]);
    let app = app(config, stores.clone());

    let response = oauth_sign_in(&app).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_text(response).await;
    assert!(body.contains("did not share an email address"));
    assert!(!body.contains("not allowed to access"));
    assert_eq!(stores.sessions.count("").await.unwrap(), 0);
}

#[tokio::test]
async fn query_fields_follow_the_remembered_target() {
    let server = provider_returning(serde_json::json!({
        "email": "ada@example.com",
        "preferred_username": "ada"
    }))
    .await;
    let config = oidc_config(&server).with_forwarding(
        vec![
            ForwardingField::query("email", "user"),
            ForwardingField::header("username", "X-User"),
        ],
        None,
    );
    let app = app(config, StoreSet::in_memory());

    let response = send(&app, get("/_auth/oauth2/start/corp")).await;
    let authorize = url::Url::parse(location(&response)).unwrap();
    let state = authorize
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let mut cookies = cookie_pairs(&response);
    cookies.push(signed_redirect_cookie("/reports?year=2024#summary"));
    let callback = format!("/_auth/oauth2/callback?code=c&state={}", urlencoding::encode(&state));
    let response = send(&app, get_with_cookies(&callback, &cookies.join("; "))).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        location(&response),
        "/reports?year=2024&user=ada%40example.com#summary"
    );
}

fn email_app(sender: Arc<CapturingSender>, stores: StoreSet) -> Router {
    let config = GatewayConfig::new(SECRET).with_email(EmailSettings {
        enabled: true,
        ..Default::default()
    });
    Gateway::builder()
        .config(config)
        .stores(stores)
        .email_sender(sender)
        .build()
        .unwrap()
        .router(upstream())
}

#[tokio::test]
async fn email_link_signs_in_once() {
    let sender = Arc::new(CapturingSender::default());
    let stores = StoreSet::in_memory();
    let app = email_app(sender.clone(), stores.clone());

    let response = send(&app, post_form("/_auth/email/send", "email=ada%40example.com", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let message = sender.last();
    assert_eq!(message.to_email, "ada@example.com");
    let link = url::Url::parse(&message.magic_link).unwrap();
    assert_eq!(link.host_str(), Some("app.example.com"));
    assert_eq!(link.path(), "/_auth/email/verify");
    let path_and_query = format!("{}?{}", link.path(), link.query().unwrap());

    let response = send(&app, get(&path_and_query)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
    let pairs = cookie_pairs(&response);
    let session = cookie_named(&pairs, "authgate_session").unwrap();

    let body = body_text(send(&app, get_with_cookies("/", session)).await).await;
    assert!(body.contains("x-auth-provider: email"));

    let response = send(&app, get(&path_and_query)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("invalid or expired"));
}

#[tokio::test]
async fn email_code_signs_in_once() {
    let sender = Arc::new(CapturingSender::default());
    let app = email_app(sender.clone(), StoreSet::in_memory());

    send(&app, post_form("/_auth/email/send", "email=ada%40example.com", None)).await;
    let otp = sender.last().otp;
    let typed = format!(
        "otp={}",
        urlencoding::encode(&format!(" {}-{}-{} ", &otp[..4], &otp[4..8], &otp[8..]).to_lowercase())
    );

    let response = send(&app, post_form("/_auth/email/verify-otp", &typed, None)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(cookie_named(&cookie_pairs(&response), "authgate_session").is_some());

    let response = send(&app, post_form("/_auth/email/verify-otp", &typed, None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, post_form("/_auth/email/verify-otp", "otp=NOTACODE0000", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("invalid or expired"));
}

#[tokio::test]
async fn email_send_is_throttled_quietly() {
    let sender = Arc::new(CapturingSender::default());
    let app = email_app(sender.clone(), StoreSet::in_memory());

    for _ in 0..7 {
        let response =
            send(&app, post_form("/_auth/email/send", "email=ada%40example.com", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(sender.count(), 5);

    let response = send(&app, post_form("/_auth/email/send", "email=not-an-email", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn email_routes_are_absent_when_disabled() {
    let app = app(password_config(), StoreSet::in_memory());
    let response = send(&app, post_form("/_auth/email/send", "email=ada%40example.com", None)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = send(&app, get("/_auth/email/verify?token=x")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
